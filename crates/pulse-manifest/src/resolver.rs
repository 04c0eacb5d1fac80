//! Filesystem predicates behind the data tags.
//!
//! A resolver answers one question: do the artefacts for a tag exist on
//! disk right now? Stages depend on tags, never on paths, so the concrete
//! directory layout lives here and nowhere else.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use pulse_types::DataTag;
use serde::{Deserialize, Serialize};

/// Presence record for one data tag.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TagInfo {
    pub present: bool,
    /// An example artefact satisfying the tag, when one is known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl TagInfo {
    /// The tag's artefacts are not on disk.
    pub fn absent() -> Self {
        Self::default()
    }

    /// The tag is satisfied by `path` as of `updated_at`.
    pub fn present_at(path: impl Into<PathBuf>, updated_at: DateTime<Utc>) -> Self {
        Self {
            present: true,
            path: Some(path.into()),
            updated_at: Some(updated_at),
        }
    }
}

/// Inspects the filesystem and reports whether a tag is satisfied.
///
/// Probes must be cheap (a directory scan at most); they run on the
/// scheduler path between stages.
pub trait TagResolver: Send + Sync {
    fn tag(&self) -> &DataTag;
    fn probe(&self) -> TagInfo;
}

/// Tag satisfied when any regular file in a directory matches a name predicate.
pub struct DirScanResolver {
    tag: DataTag,
    dir: PathBuf,
    matches: fn(&str) -> bool,
}

impl DirScanResolver {
    pub fn new(tag: DataTag, dir: impl Into<PathBuf>, matches: fn(&str) -> bool) -> Self {
        Self {
            tag,
            dir: dir.into(),
            matches,
        }
    }
}

impl TagResolver for DirScanResolver {
    fn tag(&self) -> &DataTag {
        &self.tag
    }

    fn probe(&self) -> TagInfo {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return TagInfo::absent();
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !(self.matches)(name) {
                continue;
            }
            if !entry.file_type().is_ok_and(|t| t.is_file()) {
                continue;
            }
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Utc>::from);
            return TagInfo {
                present: true,
                path: Some(entry.path()),
                updated_at: modified,
            };
        }
        TagInfo::absent()
    }
}

/// Tag satisfied by one well-known file.
pub struct FileResolver {
    tag: DataTag,
    path: PathBuf,
}

impl FileResolver {
    pub fn new(tag: DataTag, path: impl Into<PathBuf>) -> Self {
        Self {
            tag,
            path: path.into(),
        }
    }
}

impl TagResolver for FileResolver {
    fn tag(&self) -> &DataTag {
        &self.tag
    }

    fn probe(&self) -> TagInfo {
        match fs::metadata(&self.path) {
            Ok(meta) if meta.is_file() => TagInfo {
                present: true,
                path: Some(self.path.clone()),
                updated_at: meta.modified().ok().map(DateTime::<Utc>::from),
            },
            _ => TagInfo::absent(),
        }
    }
}

fn is_daily_report_workbook(name: &str) -> bool {
    name.ends_with(".xlsx") && name.contains("ISX Daily Report")
}

fn is_daily_csv(name: &str) -> bool {
    name.starts_with("isx_daily_") && name.ends_with(".csv")
}

fn is_ticker_history(name: &str) -> bool {
    name.ends_with("_trading_history.csv")
}

fn is_liquidity_report(name: &str) -> bool {
    name.starts_with("liquidity_") && name.ends_with(".csv")
}

/// The standard output layout rooted at a single data directory.
#[derive(Clone, Debug)]
pub struct DataLayout {
    pub downloads_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub index_file: PathBuf,
    pub ticker_dir: PathBuf,
    pub liquidity_dir: PathBuf,
}

impl DataLayout {
    pub fn under(data_dir: &Path) -> Self {
        let reports_dir = data_dir.join("reports");
        Self {
            downloads_dir: data_dir.join("downloads"),
            index_file: reports_dir.join("indexes.csv"),
            reports_dir,
            ticker_dir: data_dir.join("ticker"),
            liquidity_dir: data_dir.join("liquidity"),
        }
    }

    /// Resolvers for the five standard tags over this layout.
    pub fn resolvers(&self) -> Vec<Box<dyn TagResolver>> {
        vec![
            Box::new(DirScanResolver::new(
                DataTag::excel_files(),
                &self.downloads_dir,
                is_daily_report_workbook,
            )),
            Box::new(DirScanResolver::new(
                DataTag::csv_files(),
                &self.reports_dir,
                is_daily_csv,
            )),
            Box::new(FileResolver::new(DataTag::index_data(), &self.index_file)),
            Box::new(DirScanResolver::new(
                DataTag::ticker_data(),
                &self.ticker_dir,
                is_ticker_history,
            )),
            Box::new(DirScanResolver::new(
                DataTag::liquidity_data(),
                &self.liquidity_dir,
                is_liquidity_report,
            )),
        ]
    }
}
