//! Job registry - tracks cancellation tokens of in-flight jobs
//!
//! Downloads and generations live in separate namespaces, so a cancel sent to
//! the wrong one is simply a no-op.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

use crate::error::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Download,
    Generation,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Download => write!(f, "download"),
            JobKind::Generation => write!(f, "generation"),
        }
    }
}

#[derive(Default)]
struct Namespaces {
    downloads: HashMap<String, CancellationToken>,
    generations: HashMap<String, CancellationToken>,
}

impl Namespaces {
    fn get_mut(&mut self, kind: JobKind) -> &mut HashMap<String, CancellationToken> {
        match kind {
            JobKind::Download => &mut self.downloads,
            JobKind::Generation => &mut self.generations,
        }
    }
}

/// Registry of active jobs, shared between the dispatcher and job tasks
#[derive(Clone, Default)]
pub struct JobRegistry {
    inner: Arc<Mutex<Namespaces>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Namespaces> {
        // The lock only ever guards map mutations, so a poisoned map is still consistent
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a job. The returned guard removes the entry when dropped.
    pub fn register(
        &self,
        kind: JobKind,
        id: &str,
        token: CancellationToken,
    ) -> Result<JobGuard, ProtocolError> {
        let mut jobs = self.lock();
        let map = jobs.get_mut(kind);
        if map.contains_key(id) {
            return Err(ProtocolError::DuplicateJob(id.to_string()));
        }
        map.insert(id.to_string(), token.clone());
        drop(jobs);

        log::debug!("Registered {} job {}", kind, id);
        Ok(JobGuard {
            registry: self.clone(),
            kind,
            id: id.to_string(),
            token,
        })
    }

    /// Request cancellation. Unknown ids are ignored.
    pub fn cancel(&self, kind: JobKind, id: &str) -> bool {
        let token = self.lock().get_mut(kind).get(id).cloned();
        match token {
            Some(token) => {
                log::info!("Cancelling {} job {}", kind, id);
                token.cancel();
                true
            }
            None => {
                log::debug!("Cancel for unknown {} job {} ignored", kind, id);
                false
            }
        }
    }

    pub fn deregister(&self, kind: JobKind, id: &str) {
        if self.lock().get_mut(kind).remove(id).is_some() {
            log::debug!("Deregistered {} job {}", kind, id);
        }
    }

    /// Cancel every registered job in both namespaces
    pub fn cancel_all(&self) -> usize {
        let tokens: Vec<CancellationToken> = {
            let jobs = self.lock();
            jobs.downloads
                .values()
                .chain(jobs.generations.values())
                .cloned()
                .collect()
        };
        for token in &tokens {
            token.cancel();
        }
        tokens.len()
    }

    pub fn is_active(&self, kind: JobKind, id: &str) -> bool {
        self.lock().get_mut(kind).contains_key(id)
    }

    pub fn active_count(&self) -> usize {
        let jobs = self.lock();
        jobs.downloads.len() + jobs.generations.len()
    }
}

/// Registration handle owned by a running job
pub struct JobGuard {
    registry: JobRegistry,
    kind: JobKind,
    id: String,
    token: CancellationToken,
}

impl JobGuard {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.registry.deregister(self.kind, &self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_deregisters_on_drop() {
        let registry = JobRegistry::new();
        let guard = registry
            .register(JobKind::Download, "d1", CancellationToken::new())
            .unwrap();
        assert!(registry.is_active(JobKind::Download, "d1"));
        drop(guard);
        assert!(!registry.is_active(JobKind::Download, "d1"));
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_cancel_is_namespaced_and_idempotent() {
        let registry = JobRegistry::new();
        let guard = registry
            .register(JobKind::Generation, "job", CancellationToken::new())
            .unwrap();

        assert!(!registry.cancel(JobKind::Download, "job"));
        assert!(!guard.token().is_cancelled());

        assert!(registry.cancel(JobKind::Generation, "job"));
        assert!(registry.cancel(JobKind::Generation, "job"));
        assert!(guard.token().is_cancelled());

        assert!(!registry.cancel(JobKind::Generation, "missing"));
    }

    #[test]
    fn test_duplicate_id_rejected_without_touching_running_job() {
        let registry = JobRegistry::new();
        let _first = registry
            .register(JobKind::Download, "d1", CancellationToken::new())
            .unwrap();
        let err = registry
            .register(JobKind::Download, "d1", CancellationToken::new())
            .err()
            .unwrap();
        assert_eq!(err, ProtocolError::DuplicateJob("d1".to_string()));
        assert!(registry.is_active(JobKind::Download, "d1"));

        // Same id in the other namespace is fine
        assert!(registry
            .register(JobKind::Generation, "d1", CancellationToken::new())
            .is_ok());
    }

    #[test]
    fn test_cancel_all() {
        let registry = JobRegistry::new();
        let a = registry
            .register(JobKind::Download, "a", CancellationToken::new())
            .unwrap();
        let b = registry
            .register(JobKind::Generation, "b", CancellationToken::new())
            .unwrap();
        assert_eq!(registry.cancel_all(), 2);
        assert!(a.token().is_cancelled());
        assert!(b.token().is_cancelled());
    }
}
