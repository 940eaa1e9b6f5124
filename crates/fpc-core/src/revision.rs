//! Per-site element revision, rotated by global purges.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use fpc_storage::{Storage, StorageExt};

use crate::md5_hex;

const REVISION_FILE: &str = "element-revision.json";
const REVISION_PREFIX: &str = "nitro-";
const REVISION_HASH_LEN: usize = 7;

/// Revision string stored in `element-revision.json`, keyed by site id.
///
/// A new revision is generated on first use after every refresh. Storage
/// failures are logged and otherwise ignored.
pub struct ElementRevision {
    storage: Arc<dyn Storage>,
    site_id: String,
    path: PathBuf,
}

impl ElementRevision {
    pub fn new(storage: Arc<dyn Storage>, site_id: impl Into<String>) -> Self {
        Self {
            storage,
            site_id: site_id.into(),
            path: PathBuf::from(REVISION_FILE),
        }
    }

    /// The current revision, generating one if none is stored.
    pub fn get(&self) -> String {
        let mut revisions = self.load();
        if let Some(revision) = revisions.get(&self.site_id).filter(|r| !r.is_empty()) {
            return revision.clone();
        }

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos());
        let mut hash = md5_hex(nanos.to_string());
        hash.truncate(REVISION_HASH_LEN);
        let revision = format!("{REVISION_PREFIX}{hash}");

        revisions.insert(self.site_id.clone(), revision.clone());
        self.save(&revisions);
        revision
    }

    /// Drop the stored revision so the next [`get`](Self::get) makes a new one.
    pub fn refresh(&self) {
        let mut revisions = self.load();
        revisions.insert(self.site_id.clone(), String::new());
        self.save(&revisions);
    }

    fn load(&self) -> BTreeMap<String, String> {
        match self.storage.read_json(&self.path) {
            Ok(revisions) => revisions.unwrap_or_default(),
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring unreadable element revisions");
                BTreeMap::new()
            }
        }
    }

    fn save(&self, revisions: &BTreeMap<String, String>) {
        if let Err(e) = self.storage.write_json(&self.path, revisions) {
            tracing::warn!(error = %e, "Failed to store element revision");
        }
    }
}
