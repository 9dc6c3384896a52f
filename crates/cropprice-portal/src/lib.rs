//! Agmarknet portal automation: browser navigator contract, Chrome-backed
//! implementation, and the CSV export reader.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::browser::{
    SetDownloadBehaviorBehavior, SetDownloadBehaviorParams,
};
use chromiumoxide::element::Element;
use chromiumoxide::error::CdpError;
use chromiumoxide::Page;
use cropprice_core::{Commodity, District, STATE};
use futures::StreamExt;
use scraper::{Html, Selector};
use tempfile::TempDir;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

pub mod extract;

pub use extract::{extract_latest_price, read_export, ExportedTable};

pub const CRATE_NAME: &str = "cropprice-portal";

pub const DEFAULT_PORTAL_URL: &str = "https://www.agmarknet.gov.in/home";

/// XPath/CSS locators for the portal's filter form.
pub mod locators {
    pub const STATE_DROPDOWN: &str = "//*[@id='state']";
    pub const DISTRICT_DROPDOWN: &str = "//*[@id='district']";
    pub const COMMODITY_DROPDOWN: &str = "//*[@id='commodity']";
    pub const ALL_STATES: &str = "//span[text()='All States']/parent::div";
    pub const ALL_DISTRICTS: &str = "//span[contains(text(),'All District')]/parent::div";
    pub const GO_BUTTON: &str = "//button[contains(., 'Go')]";
    pub const DOWNLOAD_BUTTON: &str = "//button[contains(@aria-label,'Download')]";
    pub const DOWNLOAD_CSV_BUTTON: &str = "//button[contains(., 'Download as CSV')]";
    pub const RESULTS_TABLE: &str = "table";
}

#[derive(Debug, Error)]
pub enum NavigatorError {
    #[error("browser session failed to start: {0}")]
    Launch(String),
    #[error("no active browser session")]
    NoSession,
    #[error("{what} not ready within {timeout:?}")]
    NotReady { what: String, timeout: Duration },
    #[error("browser: {0}")]
    Browser(#[from] CdpError),
}

impl NavigatorError {
    /// Timeouts mean the portal has nothing for the current filters.
    pub fn is_no_data(&self) -> bool {
        matches!(self, NavigatorError::NotReady { .. })
    }
}

/// Drives one browser session through the portal's filter form.
#[async_trait]
pub trait PortalNavigator: Send {
    async fn start_session(
        &mut self,
        download_dir: &Path,
        chrome_binary: Option<&Path>,
    ) -> Result<(), NavigatorError>;

    async fn open(&mut self, url: &str) -> Result<(), NavigatorError>;

    async fn select_filters(
        &mut self,
        district: &District,
        commodity: &Commodity,
    ) -> Result<(), NavigatorError>;

    async fn submit(&mut self) -> Result<(), NavigatorError>;

    /// Presence-check for the results table; `false` once the wait expires.
    async fn has_results(&mut self) -> Result<bool, NavigatorError>;

    async fn export_csv(&mut self) -> Result<(), NavigatorError>;

    /// Release the session. Safe to call with no session or more than once.
    async fn end_session(&mut self);

    fn latest_downloaded_file(&self, download_dir: &Path) -> anyhow::Result<Option<PathBuf>> {
        cropprice_storage::latest_downloaded_file(download_dir)
    }
}

/// Hands out a fresh navigator per pair.
pub trait NavigatorFactory: Send + Sync {
    fn create(&self) -> Box<dyn PortalNavigator>;
}

#[derive(Debug, Clone)]
pub struct ChromeSettings {
    pub headless: bool,
    pub element_timeout: Duration,
    pub poll_interval: Duration,
    /// Pause after each dropdown interaction while the widget re-renders.
    pub step_delay: Duration,
}

impl Default for ChromeSettings {
    fn default() -> Self {
        Self {
            headless: false,
            element_timeout: Duration::from_secs(20),
            poll_interval: Duration::from_millis(500),
            step_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChromeNavigatorFactory {
    pub settings: ChromeSettings,
}

impl NavigatorFactory for ChromeNavigatorFactory {
    fn create(&self) -> Box<dyn PortalNavigator> {
        Box::new(ChromeNavigator::new(self.settings.clone()))
    }
}

struct BrowserSession {
    browser: Browser,
    page: Page,
    handler: JoinHandle<()>,
    _profile: TempDir,
}

/// Chrome over the DevTools protocol.
///
/// Dropping a navigator with a live session aborts the event handler and lets
/// chromiumoxide kill the child process; `end_session` is the graceful path.
pub struct ChromeNavigator {
    settings: ChromeSettings,
    session: Option<BrowserSession>,
}

impl ChromeNavigator {
    pub fn new(settings: ChromeSettings) -> Self {
        Self {
            settings,
            session: None,
        }
    }

    fn page(&self) -> Result<&Page, NavigatorError> {
        self.session
            .as_ref()
            .map(|s| &s.page)
            .ok_or(NavigatorError::NoSession)
    }

    fn browser_config(
        &self,
        chrome_binary: Option<&Path>,
        profile: &Path,
    ) -> Result<BrowserConfig, NavigatorError> {
        let mut builder = BrowserConfig::builder()
            .user_data_dir(profile)
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--start-maximized")
            .request_timeout(self.settings.element_timeout);
        if !self.settings.headless {
            builder = builder.with_head();
        }
        match chrome_binary {
            Some(path) if !path.exists() => {
                return Err(NavigatorError::Launch(format!(
                    "chrome binary {} does not exist",
                    path.display()
                )));
            }
            Some(path) => builder = builder.chrome_executable(path),
            None => debug!("no chrome binary configured, auto-detecting"),
        }
        builder.build().map_err(NavigatorError::Launch)
    }

    /// Poll until `xpath` resolves to an element with a clickable point.
    async fn wait_clickable(&self, xpath: &str) -> Result<Element, NavigatorError> {
        let page = self.page()?;
        let deadline = Instant::now() + self.settings.element_timeout;
        loop {
            if let Ok(element) = page.find_xpath(xpath).await {
                if element.clickable_point().await.is_ok() {
                    return Ok(element);
                }
            }
            if Instant::now() >= deadline {
                return Err(NavigatorError::NotReady {
                    what: xpath.to_string(),
                    timeout: self.settings.element_timeout,
                });
            }
            sleep(self.settings.poll_interval).await;
        }
    }

    async fn click(&self, xpath: &str) -> Result<(), NavigatorError> {
        let element = self.wait_clickable(xpath).await?;
        element.click().await?;
        debug!(xpath, "clicked");
        sleep(self.settings.step_delay).await;
        Ok(())
    }

    /// Close the open dropdown overlay.
    async fn dismiss_overlay(&self) -> Result<(), NavigatorError> {
        let page = self.page()?;
        page.find_element("body").await?.press_key("Escape").await?;
        sleep(self.settings.step_delay).await;
        Ok(())
    }
}

#[async_trait]
impl PortalNavigator for ChromeNavigator {
    async fn start_session(
        &mut self,
        download_dir: &Path,
        chrome_binary: Option<&Path>,
    ) -> Result<(), NavigatorError> {
        if self.session.is_some() {
            return Ok(());
        }
        let profile = TempDir::new().map_err(|err| NavigatorError::Launch(err.to_string()))?;
        let config = self.browser_config(chrome_binary, profile.path())?;
        let (browser, mut events) = Browser::launch(config)
            .await
            .map_err(|err| NavigatorError::Launch(err.to_string()))?;
        let handler = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let mut download = SetDownloadBehaviorParams::new(SetDownloadBehaviorBehavior::Allow);
        download.download_path = Some(download_dir.display().to_string());
        let page = match browser.execute(download).await {
            Ok(_) => browser.new_page("about:blank").await,
            Err(err) => Err(err),
        };
        let page = match page {
            Ok(page) => page,
            Err(err) => {
                handler.abort();
                return Err(NavigatorError::Launch(err.to_string()));
            }
        };

        info!(download_dir = %download_dir.display(), "browser session started");
        self.session = Some(BrowserSession {
            browser,
            page,
            handler,
            _profile: profile,
        });
        Ok(())
    }

    async fn open(&mut self, url: &str) -> Result<(), NavigatorError> {
        self.page()?.goto(url).await?;
        Ok(())
    }

    async fn select_filters(
        &mut self,
        district: &District,
        commodity: &Commodity,
    ) -> Result<(), NavigatorError> {
        self.click(locators::STATE_DROPDOWN).await?;
        self.click(locators::ALL_STATES).await?;
        self.click(&option_by_text(STATE)).await?;
        self.dismiss_overlay().await?;

        self.click(locators::DISTRICT_DROPDOWN).await?;
        self.click(locators::ALL_DISTRICTS).await?;
        self.click(&option_by_text(district.as_str())).await?;
        self.dismiss_overlay().await?;

        self.click(locators::COMMODITY_DROPDOWN).await?;
        self.click(&option_by_normalized_text(&commodity.name)).await?;
        self.dismiss_overlay().await
    }

    async fn submit(&mut self) -> Result<(), NavigatorError> {
        let go = self.wait_clickable(locators::GO_BUTTON).await?;
        go.click().await?;
        Ok(())
    }

    async fn has_results(&mut self) -> Result<bool, NavigatorError> {
        let page = self.page()?;
        let deadline = Instant::now() + self.settings.element_timeout;
        loop {
            if html_has_results_table(&page.content().await?) {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(self.settings.poll_interval).await;
        }
    }

    async fn export_csv(&mut self) -> Result<(), NavigatorError> {
        self.click(locators::DOWNLOAD_BUTTON).await?;
        let csv = self.wait_clickable(locators::DOWNLOAD_CSV_BUTTON).await?;
        csv.click().await?;
        Ok(())
    }

    async fn end_session(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let teardown = shutdown_browser(&mut session.browser, self.settings.element_timeout).await;
        session.handler.abort();
        debug!(?teardown, "browser session ended");
    }
}

impl Drop for ChromeNavigator {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            warn!("browser session dropped without end_session; killing browser");
            session.handler.abort();
        }
    }
}

/// The browser-process operations teardown needs.
#[async_trait]
trait BrowserProcess: Send {
    async fn request_close(&mut self) -> Result<(), String>;
    async fn force_kill(&mut self);
    async fn wait_exit(&mut self) -> Result<(), String>;
}

#[async_trait]
impl BrowserProcess for Browser {
    async fn request_close(&mut self) -> Result<(), String> {
        Browser::close(self).await.map(|_| ()).map_err(|err| err.to_string())
    }

    async fn force_kill(&mut self) {
        if let Some(Err(err)) = Browser::kill(self).await {
            warn!(error = %err, "killing browser failed");
        }
    }

    async fn wait_exit(&mut self) -> Result<(), String> {
        Browser::wait(self).await.map(|_| ()).map_err(|err| err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    Closed,
    Killed,
}

/// Close the browser, killing it when close fails or the process does not
/// exit within `grace`. Every wait here is bounded.
async fn shutdown_browser(process: &mut dyn BrowserProcess, grace: Duration) -> Teardown {
    if let Err(err) = process.request_close().await {
        warn!(error = %err, "closing browser failed; killing it");
        return kill_and_reap(process, grace).await;
    }
    match tokio::time::timeout(grace, process.wait_exit()).await {
        Ok(Ok(())) => Teardown::Closed,
        Ok(Err(err)) => {
            warn!(error = %err, "waiting for browser exit failed");
            Teardown::Closed
        }
        Err(_) => {
            warn!(?grace, "browser did not exit after close; killing it");
            kill_and_reap(process, grace).await
        }
    }
}

async fn kill_and_reap(process: &mut dyn BrowserProcess, grace: Duration) -> Teardown {
    process.force_kill().await;
    if tokio::time::timeout(grace, process.wait_exit()).await.is_err() {
        warn!(?grace, "browser still running after kill");
    }
    Teardown::Killed
}

/// Quote `value` as an XPath string literal, splitting on quotes when needed.
pub fn xpath_literal(value: &str) -> String {
    if !value.contains('\'') {
        format!("'{value}'")
    } else if !value.contains('"') {
        format!("\"{value}\"")
    } else {
        let parts = value
            .split('\'')
            .map(|part| format!("'{part}'"))
            .collect::<Vec<_>>()
            .join(", \"'\", ");
        format!("concat({parts})")
    }
}

/// Dropdown option whose label text equals `label` exactly.
pub fn option_by_text(label: &str) -> String {
    format!("//span[text()={}]/parent::div", xpath_literal(label))
}

/// Dropdown option whose whitespace-normalised label equals `label`.
pub fn option_by_normalized_text(label: &str) -> String {
    let normalized = label.split_whitespace().collect::<Vec<_>>().join(" ");
    format!(
        "//span[normalize-space()={}]/parent::div",
        xpath_literal(&normalized)
    )
}

pub fn html_has_results_table(html: &str) -> bool {
    let Ok(selector) = Selector::parse(locators::RESULTS_TABLE) else {
        return false;
    };
    Html::parse_document(html).select(&selector).next().is_some()
}
