use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier for a class of artefacts on the shared filesystem.
///
/// Tags are the unit of dependency between stages: a stage declares the
/// tags it reads and the tags it produces, never concrete paths, so the
/// directory layout can evolve without scheduler changes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataTag(String);

impl DataTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Downloaded daily-report workbooks.
    pub fn excel_files() -> Self {
        Self::new("excel_files")
    }

    /// Per-day processed CSV reports.
    pub fn csv_files() -> Self {
        Self::new("csv_files")
    }

    /// The combined market-index CSV.
    pub fn index_data() -> Self {
        Self::new("index_data")
    }

    /// Per-ticker trading-history CSVs.
    pub fn ticker_data() -> Self {
        Self::new("ticker_data")
    }

    /// Liquidity report CSVs.
    pub fn liquidity_data() -> Self {
        Self::new("liquidity_data")
    }
}

impl fmt::Display for DataTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DataTag {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

impl From<String> for DataTag {
    fn from(tag: String) -> Self {
        Self(tag)
    }
}
