// ABOUTME: State owned by one worker session
// ABOUTME: Run log, output cache, and the step counters that feed the final status

use crate::cache::OutputCache;
use osiris_core::constants::ARTIFACTS_DIR;
use osiris_core::{Manifest, RunLog};
use osiris_runner::{RowTotals, StepOutcome};
use std::path::{Path, PathBuf};

pub const SPILL_DIR: &str = "spill";

pub struct Session {
    id: String,
    manifest: Manifest,
    log: RunLog,
    cache: OutputCache,
    totals: RowTotals,
    steps_executed: usize,
    steps_completed: usize,
    /// First step failure, reported as the status reason
    failure: Option<String>,
}

impl Session {
    pub fn new(id: impl Into<String>, manifest: Manifest, log: RunLog, force_spill: bool) -> Self {
        let cache = OutputCache::new(log.dir().join(SPILL_DIR), force_spill);
        Self {
            id: id.into(),
            manifest,
            log,
            cache,
            totals: RowTotals::default(),
            steps_executed: 0,
            steps_completed: 0,
            failure: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn dir(&self) -> &Path {
        self.log.dir()
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.log.dir().join(ARTIFACTS_DIR)
    }

    pub fn log_mut(&mut self) -> &mut RunLog {
        &mut self.log
    }

    pub fn cache(&self) -> &OutputCache {
        &self.cache
    }

    /// Split borrow for step execution: the log is written while the cache is read
    pub fn log_and_cache(&mut self) -> (&mut RunLog, &OutputCache) {
        (&mut self.log, &self.cache)
    }

    pub fn cache_mut(&mut self) -> &mut OutputCache {
        &mut self.cache
    }

    pub fn record(&mut self, outcome: &StepOutcome) {
        self.steps_executed += 1;
        self.totals.record(outcome);
        match &outcome.failure {
            None => self.steps_completed += 1,
            Some(failure) => {
                if self.failure.is_none() {
                    self.failure = Some(format!("step {} failed: {}", outcome.step_id, failure.error));
                }
            }
        }
    }

    /// Record a run-level failure that happened outside any step
    pub fn fail(&mut self, reason: impl Into<String>) {
        if self.failure.is_none() {
            self.failure = Some(reason.into());
        }
    }

    pub fn steps_total(&self) -> usize {
        self.manifest.steps.len()
    }

    pub fn steps_executed(&self) -> usize {
        self.steps_executed
    }

    pub fn steps_completed(&self) -> usize {
        self.steps_completed
    }

    /// Writers are authoritative; extractors are the fallback
    pub fn total_rows(&self) -> usize {
        self.totals.total_rows()
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }
}
