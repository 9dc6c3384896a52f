use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use cropprice_core::{Commodity, District, PairResult, PriceRecord, ReadFailure, RunLog};
use cropprice_portal::{read_export, NavigatorError, NavigatorFactory, PortalNavigator};
use cropprice_storage::{ExportArchive, PriceSink, WriteError};
use futures::FutureExt;
use tokio::time::sleep;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{Catalog, PipelineTimings};

/// Exports older than the download click by more than this are leftovers from
/// an earlier pair. Covers coarse filesystem timestamps.
const DOWNLOAD_CLOCK_SLACK: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct PairSettings {
    pub portal_url: String,
    pub download_dir: PathBuf,
    /// Chrome executable; auto-detected when unset.
    pub chrome_binary: Option<PathBuf>,
    pub timings: PipelineTimings,
}

/// Logs each record instead of writing it (dry runs).
#[derive(Debug, Default)]
pub struct LogOnlySink;

#[async_trait]
impl PriceSink for LogOnlySink {
    async fn insert(&self, record: &PriceRecord) -> Result<(), WriteError> {
        info!(
            crop = %record.crop_name,
            district = %record.district,
            maxprice = record.max_price,
            modelprice = ?record.model_price,
            pricedate = %record.price_date,
            "dry run: price row not written"
        );
        Ok(())
    }
}

/// Runs every commodity × district pair in order and collects the outcomes.
pub struct RunOrchestrator {
    catalog: Catalog,
    settings: PairSettings,
    navigators: Box<dyn NavigatorFactory>,
    sink: Box<dyn PriceSink>,
    archive: Option<ExportArchive>,
}

impl RunOrchestrator {
    pub fn new(
        catalog: Catalog,
        settings: PairSettings,
        navigators: Box<dyn NavigatorFactory>,
        sink: Box<dyn PriceSink>,
    ) -> Self {
        Self {
            catalog,
            settings,
            navigators,
            sink,
            archive: None,
        }
    }

    pub fn with_archive(mut self, archive: ExportArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub async fn run(&self) -> RunLog {
        let mut log = RunLog::start();
        info!(run_id = %log.run_id, pairs = self.catalog.pair_count(), "run started");

        for commodity in &self.catalog.commodities {
            for district in &self.catalog.districts {
                let span = info_span!("pair", commodity = %commodity.name, %district);
                let result = AssertUnwindSafe(self.process_pair(commodity, district))
                    .catch_unwind()
                    .instrument(span.clone())
                    .await
                    .unwrap_or_else(|payload| {
                        PairResult::Failed(format!("pair panicked: {}", panic_message(payload.as_ref())))
                    });
                let outcome = result.into_outcome(commodity, district);
                if outcome.success {
                    info!(parent: &span, "{}", outcome.message);
                } else {
                    warn!(parent: &span, "{}", outcome.message);
                }
                log.push(outcome);
            }
        }

        let log = log.finish();
        info!(
            run_id = %log.run_id,
            saved = log.saved_count(),
            total = log.outcomes.len(),
            "run finished"
        );
        log
    }

    /// Full pipeline for one pair. The browser session is ended before any
    /// file is read, on every path.
    pub async fn process_pair(&self, commodity: &Commodity, district: &District) -> PairResult {
        let mut navigator = self.navigators.create();
        let browsed = self.browse(navigator.as_mut(), commodity, district).await;
        navigator.end_session().await;

        let export_clicked_at = match browsed {
            Ok(Some(at)) => at,
            Ok(None) => return PairResult::NoData,
            Err(err) if err.is_no_data() => {
                debug!(error = %err, "treating timeout as no data");
                return PairResult::NoData;
            }
            Err(err) => return PairResult::Failed(err.to_string()),
        };

        let export = match navigator.latest_downloaded_file(&self.settings.download_dir) {
            Ok(Some(path)) if is_fresh(&path, export_clicked_at) => path,
            Ok(_) => return PairResult::ReadError(ReadFailure::NotDownloaded),
            Err(err) => return PairResult::Failed(format!("{err:#}")),
        };
        debug!(export = %export.display(), "export downloaded");

        self.archive_export(commodity, district, &export).await;

        let extract = match read_export(&export) {
            Ok(extract) => extract,
            Err(failure) => return PairResult::ReadError(failure),
        };
        let record = PriceRecord::from_extract(commodity, district, &extract);

        match self.sink.insert(&record).await {
            Ok(()) => PairResult::Saved(record),
            Err(err) => PairResult::WriteError(err.to_string()),
        }
    }

    /// Browser stage. `Ok(None)` when the results table never appears,
    /// otherwise the moment the export was requested.
    async fn browse(
        &self,
        navigator: &mut dyn PortalNavigator,
        commodity: &Commodity,
        district: &District,
    ) -> Result<Option<SystemTime>, NavigatorError> {
        let timings = self.settings.timings;
        navigator
            .start_session(&self.settings.download_dir, self.settings.chrome_binary.as_deref())
            .await?;
        navigator.open(&self.settings.portal_url).await?;
        sleep(timings.after_open).await;

        navigator.select_filters(district, commodity).await?;
        navigator.submit().await?;
        sleep(timings.after_submit).await;

        if !navigator.has_results().await? {
            return Ok(None);
        }

        let clicked_at = SystemTime::now();
        navigator.export_csv().await?;
        // No completion signal exists for browser downloads.
        sleep(timings.download_wait).await;
        Ok(Some(clicked_at))
    }

    async fn archive_export(&self, commodity: &Commodity, district: &District, export: &Path) {
        let Some(archive) = &self.archive else {
            return;
        };
        match archive
            .archive_file(&commodity.name, district.as_str(), export)
            .await
        {
            Ok(archived) => debug!(
                path = %archived.relative_path.display(),
                deduplicated = archived.deduplicated,
                "export archived"
            ),
            Err(err) => warn!(error = %format!("{err:#}"), "archiving export failed"),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

fn is_fresh(path: &Path, clicked_at: SystemTime) -> bool {
    let cutoff = clicked_at.checked_sub(DOWNLOAD_CLOCK_SLACK).unwrap_or(clicked_at);
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(|modified| modified >= cutoff)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use chrono::NaiveDate;
    use tempfile::TempDir;

    /// What a fake navigator should do for one district.
    #[derive(Debug, Clone)]
    enum Portal {
        Export(&'static str),
        NoTable,
        FilterTimeout,
        LaunchFails,
        ExportVanishes,
        Panics(&'static str),
    }

    #[derive(Debug, Default)]
    struct Calls {
        ends: usize,
        exports: usize,
    }

    struct FakeNavigator {
        scenario: Portal,
        download_dir: PathBuf,
        calls: Arc<Mutex<Calls>>,
    }

    #[async_trait]
    impl PortalNavigator for FakeNavigator {
        async fn start_session(
            &mut self,
            _download_dir: &Path,
            _chrome_binary: Option<&Path>,
        ) -> Result<(), NavigatorError> {
            match self.scenario {
                Portal::LaunchFails => Err(NavigatorError::Launch("chrome missing".into())),
                _ => Ok(()),
            }
        }

        async fn open(&mut self, _url: &str) -> Result<(), NavigatorError> {
            Ok(())
        }

        async fn select_filters(
            &mut self,
            _district: &District,
            _commodity: &Commodity,
        ) -> Result<(), NavigatorError> {
            match self.scenario {
                Portal::FilterTimeout => Err(NavigatorError::NotReady {
                    what: "district option".into(),
                    timeout: Duration::from_secs(20),
                }),
                Portal::Panics(reason) => panic!("{reason}"),
                _ => Ok(()),
            }
        }

        async fn submit(&mut self) -> Result<(), NavigatorError> {
            Ok(())
        }

        async fn has_results(&mut self) -> Result<bool, NavigatorError> {
            Ok(!matches!(self.scenario, Portal::NoTable))
        }

        async fn export_csv(&mut self) -> Result<(), NavigatorError> {
            self.calls.lock().unwrap().exports += 1;
            if let Portal::Export(csv) = self.scenario {
                std::fs::write(self.download_dir.join("export.csv"), csv)
                    .map_err(|e| NavigatorError::Launch(e.to_string()))?;
            }
            Ok(())
        }

        async fn end_session(&mut self) {
            self.calls.lock().unwrap().ends += 1;
        }
    }

    struct FakeFactory {
        by_district: Vec<(&'static str, Portal)>,
        download_dir: PathBuf,
        calls: Arc<Mutex<Calls>>,
        next: Mutex<usize>,
        district_cycle: Vec<&'static str>,
    }

    impl NavigatorFactory for FakeFactory {
        fn create(&self) -> Box<dyn PortalNavigator> {
            let mut next = self.next.lock().unwrap();
            let district = self.district_cycle[*next % self.district_cycle.len()];
            *next += 1;
            let scenario = self
                .by_district
                .iter()
                .find(|(d, _)| *d == district)
                .map(|(_, s)| s.clone())
                .unwrap_or(Portal::NoTable);
            Box::new(FakeNavigator {
                scenario,
                download_dir: self.download_dir.clone(),
                calls: Arc::clone(&self.calls),
            })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        records: Mutex<Vec<PriceRecord>>,
        fail: bool,
    }

    struct SharedSink(Arc<RecordingSink>);

    #[async_trait]
    impl PriceSink for SharedSink {
        async fn insert(&self, record: &PriceRecord) -> Result<(), WriteError> {
            if self.0.fail {
                return Err(WriteError::Database(sqlx::Error::PoolTimedOut));
            }
            self.0.records.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    const SCENARIO_A: &str = "Agmarknet\nReport\n\
        Commodity,\"Price on 05 Jun, 2024\",MSP (Rs./Quintal)\n\
        Groundnut,150.0,120.0\n";
    const NO_PRICE_COLUMNS: &str = "Agmarknet\nReport\nCommodity,Arrivals\nGroundnut,3\n";
    const EMPTY_MSP: &str = "Agmarknet\nReport\n\
        Commodity,\"Price on 05 Jun, 2024\",MSP (Rs./Quintal)\n\
        Groundnut,99.5,\n";

    struct Harness {
        orchestrator: RunOrchestrator,
        sink: Arc<RecordingSink>,
        calls: Arc<Mutex<Calls>>,
        downloads: TempDir,
    }

    fn harness(
        commodities: Vec<Commodity>,
        districts: &[&'static str],
        by_district: Vec<(&'static str, Portal)>,
        sink_fails: bool,
    ) -> Harness {
        let downloads = tempfile::tempdir().expect("tempdir");
        let calls = Arc::new(Mutex::new(Calls::default()));
        let sink = Arc::new(RecordingSink {
            records: Mutex::new(Vec::new()),
            fail: sink_fails,
        });
        let factory = FakeFactory {
            by_district,
            download_dir: downloads.path().to_path_buf(),
            calls: Arc::clone(&calls),
            next: Mutex::new(0),
            district_cycle: districts.to_vec(),
        };
        let catalog = Catalog {
            commodities,
            districts: districts.iter().map(|d| District::new(*d)).collect(),
        };
        let settings = PairSettings {
            portal_url: "http://portal.test/home".into(),
            download_dir: downloads.path().to_path_buf(),
            chrome_binary: None,
            timings: PipelineTimings::none(),
        };
        let orchestrator =
            RunOrchestrator::new(catalog, settings, Box::new(factory), Box::new(SharedSink(Arc::clone(&sink))));
        Harness {
            orchestrator,
            sink,
            calls,
            downloads,
        }
    }

    fn groundnut() -> Commodity {
        Commodity::new("Groundnut", 4)
    }

    #[tokio::test]
    async fn scenario_a_persists_latest_price_and_msp() {
        let h = harness(vec![groundnut()], &["Bidar"], vec![("Bidar", Portal::Export(SCENARIO_A))], false);
        let log = h.orchestrator.run().await;

        assert_eq!(log.outcomes.len(), 1);
        assert!(log.outcomes[0].success);
        assert_eq!(log.outcomes[0].message, "Groundnut - Inserted for Bidar");

        let records = h.sink.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.max_price, 150.0);
        assert_eq!(record.model_price, Some(120.0));
        assert_eq!(record.price_date, NaiveDate::from_ymd_opt(2024, 6, 5).unwrap());
        assert_eq!(record.crop_id, 4);
        assert_eq!(record.state, "Karnataka");
    }

    #[tokio::test]
    async fn scenario_b_no_price_columns_skips_persistence() {
        let h = harness(
            vec![groundnut()],
            &["Bidar"],
            vec![("Bidar", Portal::Export(NO_PRICE_COLUMNS))],
            false,
        );
        let log = h.orchestrator.run().await;

        assert!(!log.outcomes[0].success);
        assert_eq!(log.outcomes[0].message, "Groundnut - No price columns for Bidar");
        assert!(h.sink.records.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_table_never_exports_or_writes() {
        let h = harness(vec![groundnut()], &["Raichur"], vec![("Raichur", Portal::NoTable)], false);
        let log = h.orchestrator.run().await;

        assert_eq!(log.outcomes[0].message, "Groundnut - No data for Raichur");
        assert_eq!(h.calls.lock().unwrap().exports, 0);
        assert!(h.sink.records.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_msp_column_gives_absent_model_price() {
        let h = harness(vec![groundnut()], &["Bidar"], vec![("Bidar", Portal::Export(EMPTY_MSP))], false);
        let log = h.orchestrator.run().await;

        assert!(log.any_saved());
        let records = h.sink.records.lock().unwrap();
        assert_eq!(records[0].model_price, None);
        assert_eq!(records[0].max_price, 99.5);
    }

    #[tokio::test]
    async fn every_pair_gets_one_outcome_and_one_teardown() {
        let commodities = vec![groundnut(), Commodity::new("Sunflower", 9), Commodity::new("Paddy(Common)", 8)];
        let h = harness(
            commodities,
            &["Bidar", "Raichur"],
            vec![
                ("Bidar", Portal::FilterTimeout),
                ("Raichur", Portal::LaunchFails),
            ],
            false,
        );
        let log = h.orchestrator.run().await;

        assert_eq!(log.outcomes.len(), 6);
        assert_eq!(h.calls.lock().unwrap().ends, 6);
        let messages = log.messages().collect::<Vec<_>>();
        assert_eq!(
            messages,
            vec![
                "Groundnut - No data for Bidar",
                "ERROR Groundnut Raichur: browser session failed to start: chrome missing",
                "Sunflower - No data for Bidar",
                "ERROR Sunflower Raichur: browser session failed to start: chrome missing",
                "Paddy(Common) - No data for Bidar",
                "ERROR Paddy(Common) Raichur: browser session failed to start: chrome missing",
            ]
        );
        assert!(!log.any_saved());
    }

    #[tokio::test]
    async fn stale_download_is_not_reused() {
        let h = harness(vec![groundnut()], &["Bidar"], vec![("Bidar", Portal::ExportVanishes)], false);
        let stale = h.downloads.path().join("yesterday.csv");
        std::fs::write(&stale, SCENARIO_A).expect("write stale");
        let old = SystemTime::now() - Duration::from_secs(3600);
        std::fs::File::options()
            .write(true)
            .open(&stale)
            .and_then(|f| f.set_modified(old))
            .expect("age stale export");

        let log = h.orchestrator.run().await;
        assert_eq!(log.outcomes[0].message, "Groundnut - CSV not downloaded for Bidar");
        assert!(h.sink.records.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn database_failure_is_contained_to_its_pair() {
        let h = harness(
            vec![groundnut()],
            &["Bidar", "Raichur"],
            vec![("Bidar", Portal::Export(SCENARIO_A)), ("Raichur", Portal::NoTable)],
            true,
        );
        let log = h.orchestrator.run().await;

        assert_eq!(log.outcomes.len(), 2);
        assert!(log.outcomes[0].message.starts_with("ERROR Groundnut Bidar: "));
        assert_eq!(log.outcomes[1].message, "Groundnut - No data for Raichur");
    }

    #[tokio::test]
    async fn panicking_pair_is_recorded_and_run_continues() {
        let h = harness(
            vec![groundnut(), Commodity::new("Sunflower", 9)],
            &["Bidar", "Raichur"],
            vec![
                ("Bidar", Portal::Panics("district dropdown vanished")),
                ("Raichur", Portal::Export(SCENARIO_A)),
            ],
            false,
        );
        let log = h.orchestrator.run().await;

        let messages = log.messages().collect::<Vec<_>>();
        assert_eq!(
            messages,
            vec![
                "ERROR Groundnut Bidar: pair panicked: district dropdown vanished",
                "Groundnut - Inserted for Raichur",
                "ERROR Sunflower Bidar: pair panicked: district dropdown vanished",
                "Sunflower - Inserted for Raichur",
            ]
        );
        assert_eq!(h.sink.records.lock().unwrap().len(), 2);
    }

    #[test]
    fn panic_payloads_are_described() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let fixed: Box<dyn Any + Send> = Box::new("fixed");
        let other: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(owned.as_ref()), "owned");
        assert_eq!(panic_message(fixed.as_ref()), "fixed");
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }
}
