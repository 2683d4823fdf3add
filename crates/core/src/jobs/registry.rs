use dashmap::{DashMap, DashSet};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Bookkeeping for every job the session has seen.
///
/// `active` holds one cancellation token per running poll loop. `completed`
/// and `abandoned` only ever grow for the lifetime of the registry.
#[derive(Debug, Default)]
pub struct JobRegistry {
    active: DashMap<String, CancellationToken>,
    completed: DashSet<String>,
    abandoned: DashSet<String>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking `job_id` and hands back the token its loop must
    /// watch. Returns `None` if the job is already polled, completed, or
    /// was abandoned earlier in this session.
    pub fn register(&self, job_id: &str) -> Option<CancellationToken> {
        if self.completed.contains(job_id) || self.abandoned.contains(job_id) {
            return None;
        }

        match self.active.entry(job_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let token = CancellationToken::new();
                slot.insert(token.clone());
                if self.completed.contains(job_id) {
                    self.active.remove(job_id);
                    return None;
                }
                debug!(job_id, "Registered job for polling");
                Some(token)
            }
        }
    }

    pub fn is_completed(&self, job_id: &str) -> bool {
        self.completed.contains(job_id)
    }

    pub fn is_abandoned(&self, job_id: &str) -> bool {
        self.abandoned.contains(job_id)
    }

    pub fn is_active(&self, job_id: &str) -> bool {
        self.active.contains_key(job_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Records completion and stops any loop still polling the job.
    /// Only the first caller for a given id gets `true`.
    pub fn mark_completed(&self, job_id: &str) -> bool {
        let first = self.completed.insert(job_id.to_string());
        if let Some((_, token)) = self.active.remove(job_id) {
            token.cancel();
        }
        if first {
            debug!(job_id, "Job marked completed");
        }
        first
    }

    pub fn abandon(&self, job_id: &str) {
        if let Some((_, token)) = self.active.remove(job_id) {
            token.cancel();
        }
        if !self.completed.contains(job_id) {
            self.abandoned.insert(job_id.to_string());
        }
    }

    /// Cancels every running loop. The completed set is kept so a later
    /// `register` still refuses finished jobs.
    pub fn unregister_all(&self) {
        let ids: Vec<String> = self.active.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            if let Some((_, token)) = self.active.remove(&id) {
                token.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_register_is_noop_when_already_active() {
        let registry = JobRegistry::new();
        assert!(registry.register("job-1").is_some());
        assert!(registry.register("job-1").is_none());
        assert!(registry.is_active("job-1"));
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn test_mark_completed_is_idempotent_and_cancels_loop() {
        let registry = JobRegistry::new();
        let token = registry.register("job-1").expect("fresh job registers");

        assert!(registry.mark_completed("job-1"));
        assert!(token.is_cancelled());
        assert!(!registry.is_active("job-1"));
        assert!(registry.is_completed("job-1"));

        assert!(!registry.mark_completed("job-1"));
        assert!(registry.register("job-1").is_none());
    }

    #[test]
    fn test_concurrent_mark_completed_has_single_winner() {
        let registry = Arc::new(JobRegistry::new());
        registry.register("job-1");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.mark_completed("job-1"))
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|handle| handle.join().expect("thread joins"))
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
    }

    #[test]
    fn test_abandoned_job_is_never_reregistered() {
        let registry = JobRegistry::new();
        let token = registry.register("job-1").expect("fresh job registers");

        registry.abandon("job-1");
        assert!(token.is_cancelled());
        assert!(registry.is_abandoned("job-1"));
        assert!(registry.register("job-1").is_none());
    }

    #[test]
    fn test_unregister_all_keeps_completed_set() {
        let registry = JobRegistry::new();
        let first = registry.register("job-1").expect("registers");
        let second = registry.register("job-2").expect("registers");
        registry.mark_completed("job-3");

        registry.unregister_all();

        assert!(first.is_cancelled());
        assert!(second.is_cancelled());
        assert_eq!(registry.active_count(), 0);
        assert!(registry.is_completed("job-3"));
        assert!(registry.register("job-3").is_none());
        assert!(registry.register("job-1").is_some());
    }
}
