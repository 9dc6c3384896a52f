use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use cropprice_core::{Commodity, District};
use cropprice_portal::{ChromeSettings, DEFAULT_PORTAL_URL};
use cropprice_storage::DbSettings;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Commodities and districts to sweep, in processing order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub commodities: Vec<Commodity>,
    pub districts: Vec<District>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            commodities: vec![
                Commodity::new("Paddy(Common)", 8),
                Commodity::new("Arhar(Tur/Red Gram)(Whole)", 10),
                Commodity::new("Bengal Gram(Gram)(Whole)", 1),
                Commodity::new("Bajra(Pearl Millet/Cumbu)", 12),
                Commodity::new("Groundnut", 4),
                Commodity::new("Sunflower", 9),
                Commodity::new("Green Gram(Moong)(Whole)", 6),
                Commodity::new("Black Gram(Urd Beans)(Whole)", 11),
            ],
            districts: vec![District::new("Bidar"), District::new("Raichur")],
        }
    }
}

impl Catalog {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let catalog: Catalog = serde_yaml::from_str(text).context("parsing catalog yaml")?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Load `path`, or fall back to the built-in catalog when it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "catalog file not found, using built-in catalog");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn pair_count(&self) -> usize {
        self.commodities.len() * self.districts.len()
    }

    fn validate(&self) -> Result<()> {
        if self.commodities.is_empty() {
            bail!("catalog lists no commodities");
        }
        if self.districts.is_empty() {
            bail!("catalog lists no districts");
        }
        if let Some(c) = self.commodities.iter().find(|c| c.name.trim().is_empty()) {
            bail!("commodity id {} has an empty name", c.id);
        }
        if self.districts.iter().any(|d| d.as_str().trim().is_empty()) {
            bail!("catalog contains an empty district name");
        }
        Ok(())
    }
}

/// Fixed pauses that give the portal time to render and Chrome time to
/// finish writing the export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineTimings {
    pub after_open: Duration,
    pub after_submit: Duration,
    pub download_wait: Duration,
}

impl Default for PipelineTimings {
    fn default() -> Self {
        Self {
            after_open: Duration::from_secs(3),
            after_submit: Duration::from_secs(4),
            download_wait: Duration::from_secs(15),
        }
    }
}

impl PipelineTimings {
    pub fn none() -> Self {
        Self {
            after_open: Duration::ZERO,
            after_submit: Duration::ZERO,
            download_wait: Duration::ZERO,
        }
    }
}

#[derive(Clone)]
pub struct MailSettings {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
    pub to: Vec<String>,
}

impl fmt::Debug for MailSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailSettings")
            .field("smtp_host", &self.smtp_host)
            .field("smtp_port", &self.smtp_port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("from", &self.from)
            .field("to", &self.to)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub portal_url: String,
    pub download_dir: PathBuf,
    /// Chrome executable. Unset means auto-detect.
    pub chrome_binary: Option<PathBuf>,
    pub headless: bool,
    pub element_timeout_secs: u64,
    pub download_wait_secs: u64,
    pub archive_dir: Option<PathBuf>,
    pub reports_dir: PathBuf,
    pub catalog_path: PathBuf,
    pub schedule_cron: String,
    pub db: Option<DbSettings>,
    pub mail: Option<MailSettings>,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; secrets are only picked up when their
    /// password variable is present.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let parsed = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };

        let db = lookup("PGPASSWORD").map(|password| DbSettings {
            database: var("PGDATABASE", "pfmarketplace"),
            user: var("PGUSER", "pfmarket"),
            password,
            host: var("PGHOST", "localhost"),
            port: lookup("PGPORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(5432),
        });

        let mail = lookup("SMTP_PASSWORD").map(|password| {
            let username = var("SMTP_USER", "");
            MailSettings {
                smtp_host: var("SMTP_HOST", "smtp.office365.com"),
                smtp_port: lookup("SMTP_PORT")
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(587),
                from: lookup("MAIL_FROM").unwrap_or_else(|| username.clone()),
                username,
                password,
                to: var("MAIL_TO", "")
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(ToString::to_string)
                    .collect(),
            }
        });

        Self {
            portal_url: var("CROPPRICE_PORTAL_URL", DEFAULT_PORTAL_URL),
            download_dir: PathBuf::from(var("CROPPRICE_DOWNLOAD_DIR", "./downloads")),
            chrome_binary: lookup("CROPPRICE_CHROME_BINARY")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            headless: lookup("CROPPRICE_HEADLESS")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            element_timeout_secs: parsed("CROPPRICE_ELEMENT_TIMEOUT_SECS", 20),
            download_wait_secs: parsed("CROPPRICE_DOWNLOAD_WAIT_SECS", 15),
            archive_dir: lookup("CROPPRICE_ARCHIVE_DIR").map(PathBuf::from),
            reports_dir: PathBuf::from(var("CROPPRICE_REPORTS_DIR", "./reports")),
            catalog_path: PathBuf::from(var("CROPPRICE_CATALOG", "./catalog.yaml")),
            schedule_cron: var("CROPPRICE_SCHEDULE_CRON", "0 0 9 * * *"),
            db,
            mail,
        }
    }

    pub fn chrome_settings(&self) -> ChromeSettings {
        ChromeSettings {
            headless: self.headless,
            element_timeout: Duration::from_secs(self.element_timeout_secs),
            ..ChromeSettings::default()
        }
    }

    pub fn timings(&self) -> PipelineTimings {
        PipelineTimings {
            download_wait: Duration::from_secs(self.download_wait_secs),
            ..PipelineTimings::default()
        }
    }

    pub fn require_db(&self) -> Result<&DbSettings> {
        self.db
            .as_ref()
            .context("database credentials missing: set PGPASSWORD (and PGDATABASE/PGUSER/PGHOST/PGPORT)")
    }

    pub fn require_mail(&self) -> Result<&MailSettings> {
        let mail = self
            .mail
            .as_ref()
            .context("mail credentials missing: set SMTP_PASSWORD, SMTP_USER and MAIL_TO")?;
        if mail.to.is_empty() {
            bail!("MAIL_TO lists no recipients");
        }
        Ok(mail)
    }
}
