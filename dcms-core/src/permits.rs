//! Per-project publish exclusion
//!
//! A project can only be published by one caller at a time. The permit is
//! released when the returned guard is dropped, also on error paths.

use crate::error::{CmsError, Result};
use crate::model::ProjectId;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

#[derive(Default, Clone)]
pub struct PublishPermits {
    active: Arc<Mutex<HashSet<ProjectId>>>,
}

/// Held while a publish of `project` is in progress
pub struct PublishPermit {
    project: ProjectId,
    active: Arc<Mutex<HashSet<ProjectId>>>,
}

impl PublishPermits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `project`; `PublishInProgress` if it is already claimed
    pub fn acquire(&self, project: ProjectId) -> Result<PublishPermit> {
        let mut active = self
            .active
            .lock()
            .map_err(|_| CmsError::Store("permit set poisoned".into()))?;
        if !active.insert(project) {
            return Err(CmsError::PublishInProgress(project.0));
        }
        Ok(PublishPermit { project, active: Arc::clone(&self.active) })
    }
}

impl Drop for PublishPermit {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.project);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_fails_until_drop() {
        let permits = PublishPermits::new();
        let first = permits.acquire(ProjectId(4)).unwrap();
        assert!(matches!(permits.acquire(ProjectId(4)), Err(CmsError::PublishInProgress(4))));

        let other = permits.acquire(ProjectId(5)).unwrap();
        drop(first);
        permits.acquire(ProjectId(4)).unwrap();
        assert!(matches!(permits.acquire(ProjectId(5)), Err(CmsError::PublishInProgress(5))));
        drop(other);
        permits.acquire(ProjectId(5)).unwrap();
    }

    #[test]
    fn test_permits_shared_across_threads() {
        let permits = PublishPermits::new();
        let guard = permits.acquire(ProjectId(9)).unwrap();
        let clone = permits.clone();
        let result = std::thread::spawn(move || clone.acquire(ProjectId(9)).map(|_| ())).join().unwrap();
        assert!(matches!(result, Err(CmsError::PublishInProgress(9))));
        drop(guard);
    }
}
