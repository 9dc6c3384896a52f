//! Download-directory discovery, export archiving and price persistence.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::Context;
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

mod writer;

pub use writer::{DbSettings, PgPriceWriter, PriceSink, WriteError, INSERT_PRICE_SQL};

pub const CRATE_NAME: &str = "cropprice-storage";

/// Extension the portal uses for its CSV export.
pub const EXPORT_EXTENSION: &str = "csv";

/// Most recently modified `*.csv` in `dir`, or `None` when there is none.
///
/// A missing directory counts as empty.
pub fn latest_downloaded_file(dir: &Path) -> anyhow::Result<Option<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("reading download dir {}", dir.display()))
        }
    };

    let mut newest: Option<(SystemTime, PathBuf)> = None;
    for entry in entries.filter_map(|entry| entry.ok()) {
        let path = entry.path();
        let is_export = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case(EXPORT_EXTENSION))
            .unwrap_or(false);
        if !is_export || !path.is_file() {
            continue;
        }
        let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };
        if newest.as_ref().map_or(true, |(ts, _)| modified > *ts) {
            newest = Some((modified, path));
        }
    }
    Ok(newest.map(|(_, path)| path))
}

#[derive(Debug, Clone)]
pub struct ArchivedExport {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed archive of raw portal exports.
#[derive(Debug, Clone)]
pub struct ExportArchive {
    root: PathBuf,
}

impl ExportArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Lowercased label with every non-alphanumeric run collapsed to `-`.
    pub fn slug(label: &str) -> String {
        label
            .to_ascii_lowercase()
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("-")
    }

    /// `<commodity>_<district>/<sha256>.csv`. The same bytes always map to the
    /// same path, whichever run downloaded them.
    pub fn export_relative_path(commodity: &str, district: &str, content_hash: &str) -> PathBuf {
        PathBuf::from(format!("{}_{}", Self::slug(commodity), Self::slug(district)))
            .join(format!("{content_hash}.{EXPORT_EXTENSION}"))
    }

    /// Store a downloaded export under its content hash. A portal export that
    /// has not changed since an earlier run is recorded as deduplicated and not
    /// written again.
    pub async fn archive_file(
        &self,
        commodity: &str,
        district: &str,
        source: &Path,
    ) -> anyhow::Result<ArchivedExport> {
        let bytes = fs::read(source)
            .await
            .with_context(|| format!("reading export {}", source.display()))?;
        let content_hash = Self::sha256_hex(&bytes);
        let relative_path = Self::export_relative_path(commodity, district, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let pair_dir = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        let mut archived = ArchivedExport {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated: true,
        };
        if fs::try_exists(&archived.absolute_path).await.unwrap_or(false) {
            return Ok(archived);
        }

        fs::create_dir_all(&pair_dir)
            .await
            .with_context(|| format!("creating archive directory {}", pair_dir.display()))?;
        let staging = pair_dir.join(format!("{}.part", Uuid::new_v4()));
        fs::write(&staging, &bytes)
            .await
            .with_context(|| format!("staging export {}", staging.display()))?;
        if let Err(err) = fs::rename(&staging, &archived.absolute_path).await {
            let _ = fs::remove_file(&staging).await;
            return Err(err)
                .with_context(|| format!("moving export into {}", archived.absolute_path.display()));
        }

        archived.deduplicated = false;
        Ok(archived)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::Duration;
    use tempfile::tempdir;

    fn touch(path: &Path, age: Duration) {
        let file = File::create(path).expect("create");
        file.set_modified(SystemTime::now() - age).expect("set mtime");
    }

    #[test]
    fn latest_file_picks_newest_csv() {
        let dir = tempdir().expect("tempdir");
        touch(&dir.path().join("old.csv"), Duration::from_secs(300));
        touch(&dir.path().join("new.csv"), Duration::from_secs(5));
        touch(&dir.path().join("newest.crdownload"), Duration::from_secs(1));

        let latest = latest_downloaded_file(dir.path()).expect("scan");
        assert_eq!(latest, Some(dir.path().join("new.csv")));
    }

    #[test]
    fn latest_file_is_none_for_empty_or_missing_dir() {
        let dir = tempdir().expect("tempdir");
        assert_eq!(latest_downloaded_file(dir.path()).expect("scan"), None);
        assert_eq!(
            latest_downloaded_file(&dir.path().join("missing")).expect("scan"),
            None
        );
    }

    #[test]
    fn slug_collapses_punctuation() {
        assert_eq!(
            ExportArchive::slug("Arhar(Tur/Red Gram)(Whole)"),
            "arhar-tur-red-gram-whole"
        );
        assert_eq!(ExportArchive::slug("Bidar"), "bidar");
    }

    #[tokio::test]
    async fn unchanged_export_from_a_later_run_is_not_stored_again() {
        let downloads = tempdir().expect("tempdir");
        let archive_root = tempdir().expect("tempdir");
        let archive = ExportArchive::new(archive_root.path());

        let monday = downloads.path().join("monday.csv");
        let tuesday = downloads.path().join("tuesday.csv");
        std::fs::write(&monday, "a,b\n1,2\n").expect("write export");
        std::fs::write(&tuesday, "a,b\n1,2\n").expect("write export");

        let first = archive
            .archive_file("Groundnut", "Bidar", &monday)
            .await
            .expect("first archive");
        let second = archive
            .archive_file("Groundnut", "Bidar", &tuesday)
            .await
            .expect("second archive");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.relative_path.starts_with("groundnut_bidar"));
        assert_eq!(
            std::fs::read(&first.absolute_path).expect("read archived"),
            b"a,b\n1,2\n"
        );

        let pair_dir = archive_root.path().join("groundnut_bidar");
        assert_eq!(std::fs::read_dir(&pair_dir).expect("pair dir").count(), 1);
    }

    #[tokio::test]
    async fn changed_export_gets_its_own_entry() {
        let downloads = tempdir().expect("tempdir");
        let archive_root = tempdir().expect("tempdir");
        let archive = ExportArchive::new(archive_root.path());
        let export = downloads.path().join("export.csv");

        std::fs::write(&export, "a,b\n1,2\n").expect("write export");
        let first = archive
            .archive_file("Groundnut", "Bidar", &export)
            .await
            .expect("first archive");
        std::fs::write(&export, "a,b\n1,3\n").expect("rewrite export");
        let second = archive
            .archive_file("Groundnut", "Bidar", &export)
            .await
            .expect("second archive");

        assert!(!second.deduplicated);
        assert_ne!(first.content_hash, second.content_hash);
        assert!(first.absolute_path.exists());
        assert!(second.absolute_path.exists());
    }
}
