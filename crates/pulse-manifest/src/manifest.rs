//! In-memory projection of which data tags are satisfied on disk.
//!
//! The filesystem is the source of truth. Records written through
//! [`Manifest::record`] are a cache that lets the scheduler skip rescans
//! for outputs produced during this process's lifetime; anything older is
//! reconciled against the filesystem at lookup and snapshot time.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use pulse_types::DataTag;
use tracing::debug;

use crate::resolver::{TagInfo, TagResolver};

/// Current knowledge of which data tags are satisfied.
///
/// `record` and `snapshot` are serialised by an internal lock; probes run
/// outside it. Shared across scheduler workers behind an `Arc`.
pub struct Manifest {
    built_at: DateTime<Utc>,
    resolvers: HashMap<DataTag, Box<dyn TagResolver>>,
    records: Mutex<HashMap<DataTag, TagInfo>>,
}

impl Manifest {
    pub fn new(resolvers: Vec<Box<dyn TagResolver>>) -> Self {
        Self {
            built_at: Utc::now(),
            resolvers: resolvers
                .into_iter()
                .map(|r| (r.tag().clone(), r))
                .collect(),
            records: Mutex::new(HashMap::new()),
        }
    }

    /// A record only short-circuits the filesystem probe while it is newer
    /// than this manifest; anything else must be re-proven against disk.
    fn is_fresh(&self, info: &TagInfo) -> bool {
        info.present && info.updated_at.is_some_and(|at| at >= self.built_at)
    }

    /// True iff `tag` is satisfied: a fresh in-memory record, or the
    /// resolver's filesystem predicate. Unknown tags are never satisfied.
    pub fn has(&self, tag: &DataTag) -> bool {
        {
            let records = self.records.lock().expect("manifest records lock");
            if records.get(tag).is_some_and(|info| self.is_fresh(info)) {
                return true;
            }
        }
        self.resolvers
            .get(tag)
            .is_some_and(|resolver| resolver.probe().present)
    }

    /// Caches a produced output so later `has`/`snapshot` calls skip the
    /// rescan. Called by the runner after a successful stage.
    pub fn record(&self, tag: DataTag, info: TagInfo) {
        debug!(tag = %tag, present = info.present, "manifest record");
        self.records
            .lock()
            .expect("manifest records lock")
            .insert(tag, info);
    }

    /// A stable view over every known tag, reconciling stale records
    /// against the filesystem. Used by the scheduler to gate stages.
    pub fn snapshot(&self) -> ManifestSnapshot {
        let records = self
            .records
            .lock()
            .expect("manifest records lock")
            .clone();

        let mut entries: HashMap<DataTag, TagInfo> = HashMap::new();
        for (tag, resolver) in &self.resolvers {
            let info = match records.get(tag) {
                Some(info) if self.is_fresh(info) => info.clone(),
                _ => resolver.probe(),
            };
            entries.insert(tag.clone(), info);
        }
        // Recorded tags without a resolver (tests, ad-hoc stages) are
        // trusted as-is when fresh.
        for (tag, info) in records {
            if !entries.contains_key(&tag) && self.is_fresh(&info) {
                entries.insert(tag, info);
            }
        }

        ManifestSnapshot {
            taken_at: Utc::now(),
            entries,
        }
    }

    /// Every tag this manifest can answer for.
    pub fn tags(&self) -> Vec<DataTag> {
        let mut tags: Vec<DataTag> = self.resolvers.keys().cloned().collect();
        let records = self.records.lock().expect("manifest records lock");
        for tag in records.keys() {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }
        tags.sort();
        tags
    }
}

/// Point-in-time view of the manifest, safe to consult repeatedly while
/// planning without re-probing the filesystem.
#[derive(Clone, Debug)]
pub struct ManifestSnapshot {
    taken_at: DateTime<Utc>,
    entries: HashMap<DataTag, TagInfo>,
}

impl ManifestSnapshot {
    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    pub fn has(&self, tag: &DataTag) -> bool {
        self.entries.get(tag).is_some_and(|info| info.present)
    }

    pub fn get(&self, tag: &DataTag) -> Option<&TagInfo> {
        self.entries.get(tag)
    }

    /// The subset of `required` this snapshot does not satisfy.
    pub fn missing(&self, required: &[DataTag]) -> Vec<DataTag> {
        required
            .iter()
            .filter(|tag| !self.has(tag))
            .cloned()
            .collect()
    }
}
