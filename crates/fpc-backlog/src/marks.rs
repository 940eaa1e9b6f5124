use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fpc_storage::{Storage, StorageExt};

use crate::BacklogError;

const MARKS_FILE: &str = "time.mark";

/// Named unix timestamps kept in `time.mark`.
///
/// An unreadable file counts as empty.
#[derive(Clone)]
pub struct TimeMarks {
    storage: Arc<dyn Storage>,
    path: PathBuf,
}

impl TimeMarks {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            path: PathBuf::from(MARKS_FILE),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every mark.
    #[must_use]
    pub fn load(&self) -> BTreeMap<String, u64> {
        match self.storage.read_json(&self.path) {
            Ok(marks) => marks.unwrap_or_default(),
            Err(e) => {
                tracing::debug!(path = %self.path.display(), error = %e, "Ignoring unreadable time marks");
                BTreeMap::new()
            }
        }
    }

    /// The mark `name`, if set to something other than 0.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<u64> {
        self.load().get(name).copied().filter(|t| *t > 0)
    }

    pub fn set(&self, name: &str, time: u64) -> Result<(), BacklogError> {
        let mut marks = self.load();
        marks.insert(name.to_owned(), time);
        self.storage.write_json(&self.path, &marks)?;
        Ok(())
    }

    /// Remove `name`. Writes nothing when it is not set.
    pub fn unset(&self, name: &str) -> Result<(), BacklogError> {
        let mut marks = self.load();
        if marks.remove(name).is_some() {
            self.storage.write_json(&self.path, &marks)?;
        }
        Ok(())
    }
}
