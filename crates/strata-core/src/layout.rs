//! On-disk layout of the analytics data directory.
//!
//! ```text
//! {root}/
//!   events/{YYYYMMDD}/{HH}/*.parquet        raw events, creation-hour partitioned
//!   annotations/{YYYYMMDD}/{HH}/*.parquet   raw annotations, same partitioning
//!   preagg/{YYYYMMDD}/{HH}.parquet          Stage-1 intermediates (DID retained)
//!   aggregated/{YYYYMMDD}/{HH}.parquet      Stage-2 final artifacts, event-hour partitioned
//!   aggregated/{YYYYMMDD}/meta.json         per-date processed-mtime record
//!   aggregated/{YYYYMMDD}.parquet           consolidated daily artifact
//!   aggregated/metadata.json                dimension value index
//! ```
//!
//! Every write goes to a `.tmp` path first and is renamed into place, so
//! readers that only consider `*.parquet` names never observe partial files.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::NaiveDate;

use crate::error::{Error, Result};
use crate::partition::{PartitionKey, format_date, parse_date};

/// Artifact file extension.
pub const PARQUET_EXT: &str = "parquet";

/// Suffix of in-flight temp files.
pub const TMP_SUFFIX: &str = ".tmp";

/// Suffix of directories pending deletion.
pub const DELETING_SUFFIX: &str = ".deleting";

/// Suffix of directories being staged by a writer.
pub const WRITING_SUFFIX: &str = ".writing";

const EVENTS_DIR: &str = "events";
const ANNOTATIONS_DIR: &str = "annotations";
const PREAGG_DIR: &str = "preagg";
const AGGREGATED_DIR: &str = "aggregated";
const DATE_META_FILE: &str = "meta.json";
const METADATA_FILE: &str = "metadata.json";

/// Raw record category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RawKind {
    /// Raw events.
    Events,
    /// Raw annotations.
    Annotations,
}

impl RawKind {
    /// Top-level directory name.
    #[must_use]
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::Events => EVENTS_DIR,
            Self::Annotations => ANNOTATIONS_DIR,
        }
    }
}

/// Paths within a data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    /// Creates a layout rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Creates the top-level category directories.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.raw_dir(RawKind::Events),
            self.raw_dir(RawKind::Annotations),
            self.preagg_dir(),
            self.aggregated_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(|e| Error::io_at("creating", &dir, e))?;
        }
        Ok(())
    }

    /// Data directory root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `events/` or `annotations/`.
    #[must_use]
    pub fn raw_dir(&self, kind: RawKind) -> PathBuf {
        self.root.join(kind.dir_name())
    }

    /// `events/{date}/{hour}` or `annotations/{date}/{hour}`.
    #[must_use]
    pub fn raw_hour_dir(&self, kind: RawKind, key: PartitionKey) -> PathBuf {
        self.raw_dir(kind).join(key.date_str()).join(key.hour_str())
    }

    /// `preagg/`.
    #[must_use]
    pub fn preagg_dir(&self) -> PathBuf {
        self.root.join(PREAGG_DIR)
    }

    /// `preagg/{date}/{hour}.parquet`.
    #[must_use]
    pub fn preagg_file(&self, key: PartitionKey) -> PathBuf {
        self.preagg_dir()
            .join(key.date_str())
            .join(format!("{}.{PARQUET_EXT}", key.hour_str()))
    }

    /// `aggregated/`.
    #[must_use]
    pub fn aggregated_dir(&self) -> PathBuf {
        self.root.join(AGGREGATED_DIR)
    }

    /// `aggregated/{date}` (hourly final artifacts and `meta.json`).
    #[must_use]
    pub fn hourly_dir(&self, date: NaiveDate) -> PathBuf {
        self.aggregated_dir().join(format_date(date))
    }

    /// `aggregated/{date}/{hour}.parquet`.
    #[must_use]
    pub fn hourly_artifact(&self, key: PartitionKey) -> PathBuf {
        self.hourly_dir(key.date())
            .join(format!("{}.{PARQUET_EXT}", key.hour_str()))
    }

    /// `aggregated/{date}.parquet`.
    #[must_use]
    pub fn daily_artifact(&self, date: NaiveDate) -> PathBuf {
        self.aggregated_dir()
            .join(format!("{}.{PARQUET_EXT}", format_date(date)))
    }

    /// `aggregated/{date}/meta.json`.
    #[must_use]
    pub fn date_meta(&self, date: NaiveDate) -> PathBuf {
        self.hourly_dir(date).join(DATE_META_FILE)
    }

    /// `aggregated/metadata.json`.
    #[must_use]
    pub fn metadata_file(&self) -> PathBuf {
        self.aggregated_dir().join(METADATA_FILE)
    }

    /// Whether `date` has been consolidated into a daily artifact.
    #[must_use]
    pub fn is_archived(&self, date: NaiveDate) -> bool {
        self.daily_artifact(date).is_file()
    }

    /// Partition date directories directly under `dir`, ascending.
    ///
    /// Staging directories (`.writing`, `.deleting`) and non-date names are
    /// skipped. A missing `dir` yields an empty list.
    ///
    /// # Errors
    ///
    /// Returns an error if `dir` exists but cannot be listed.
    pub fn date_dirs(dir: &Path) -> Result<Vec<NaiveDate>> {
        let mut dates = Vec::new();
        for entry in read_dir_if_exists(dir)? {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if !file_type.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.ends_with(WRITING_SUFFIX) || name.ends_with(DELETING_SUFFIX) {
                continue;
            }
            if let Some(date) = parse_date(name) {
                dates.push(date);
            }
        }
        dates.sort_unstable();
        Ok(dates)
    }

    /// Every final artifact currently on disk: daily files plus hourly files.
    ///
    /// # Errors
    ///
    /// Returns an error if the aggregated directory cannot be listed.
    pub fn all_final_artifacts(&self) -> Result<Vec<PathBuf>> {
        let aggregated = self.aggregated_dir();
        let mut files = Vec::new();
        for date in Self::date_dirs(&aggregated)? {
            files.extend(parquet_files(&self.hourly_dir(date))?);
        }
        for path in parquet_files(&aggregated)? {
            let is_daily = path
                .file_stem()
                .and_then(|s| s.to_str())
                .is_some_and(|s| parse_date(s).is_some());
            if is_daily {
                files.push(path);
            }
        }
        Ok(files)
    }
}

fn read_dir_if_exists(dir: &Path) -> Result<Vec<fs::DirEntry>> {
    match fs::read_dir(dir) {
        Ok(entries) => Ok(entries.filter_map(std::result::Result::ok).collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(Error::io_at("listing", dir, e)),
    }
}

/// Committed `*.parquet` files directly inside `dir`, sorted by name.
///
/// Hidden names and temp files are excluded; a missing directory is empty.
///
/// # Errors
///
/// Returns an error if `dir` exists but cannot be listed.
pub fn parquet_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = read_dir_if_exists(dir)?
        .into_iter()
        .filter(|entry| entry.file_type().is_ok_and(|t| t.is_file()))
        .map(|entry| entry.path())
        .filter(|path| is_committed_parquet(path))
        .collect();
    files.sort();
    Ok(files)
}

fn is_committed_parquet(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    !name.starts_with('.')
        && path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(PARQUET_EXT))
}

/// Modification time of `path`, if it exists.
#[must_use]
pub fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Latest modification time across `files` (`None` if none could be read).
#[must_use]
pub fn max_mtime<'a>(files: impl IntoIterator<Item = &'a PathBuf>) -> Option<SystemTime> {
    files.into_iter().filter_map(|f| modified(f)).max()
}

/// Path of the temp file used while writing `path` (`{path}.tmp`).
#[must_use]
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(TMP_SUFFIX);
    PathBuf::from(name)
}

/// Writes `bytes` to `path` via a `.tmp` sibling and an atomic rename.
///
/// Parent directories are created as needed. On failure the temp file is
/// removed and `path` is left untouched.
///
/// # Errors
///
/// Returns an error if the temp file cannot be written or renamed.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io_at("creating", parent, e))?;
    }
    let tmp = tmp_path(path);
    let written = fs::File::create(&tmp)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        })
        .map_err(|e| Error::io_at("writing", &tmp, e));
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(Error::io_at("renaming into", path, e));
    }
    Ok(())
}

/// Removes `path`, treating "already gone" as success.
///
/// # Errors
///
/// Returns an error for any failure other than `NotFound`.
pub fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::io_at("removing", path, e)),
    }
}
