//! Concurrent get-or-load scenario

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Barrier;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{ensure, Result};
use flightcache::{CacheManager, Outcome};
use tracing::{debug, info};

/// Shape of one stress run
#[derive(Debug, Clone)]
pub struct Scenario {
    pub callers: usize,
    pub keys: usize,
    pub rounds: usize,
    pub loader_delay: Duration,
    pub ttl: Duration,
    /// Fail every n-th loader execution (0 = never)
    pub fail_every: u64,
}

/// Tally of outcomes across all rounds
#[derive(Debug, Default)]
pub struct Report {
    pub found: usize,
    pub absent: usize,
    pub failed: usize,
    pub loader_runs: u64,
    pub elapsed: Duration,
}

#[derive(Debug)]
struct LoaderFailure(u64);

impl std::fmt::Display for LoaderFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "injected failure on loader run {}", self.0)
    }
}

impl std::error::Error for LoaderFailure {}

impl Scenario {
    /// Loader executions expected if every round is perfectly single-flight
    pub fn expected_loads(&self) -> u64 {
        (self.keys * self.rounds) as u64
    }

    /// Run every round against `cache`, clearing it between rounds
    pub fn run(&self, cache: &CacheManager) -> Result<Report> {
        ensure!(self.callers > 0, "at least one caller is required");
        ensure!(self.keys > 0, "at least one key is required");

        let loader_runs = AtomicU64::new(0);
        let found = AtomicUsize::new(0);
        let absent = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);
        let start = Instant::now();

        for round in 0..self.rounds {
            let barrier = Barrier::new(self.callers);

            thread::scope(|scope| {
                for caller in 0..self.callers {
                    let barrier = &barrier;
                    let loader_runs = &loader_runs;
                    let (found, absent, failed) = (&found, &absent, &failed);

                    scope.spawn(move || {
                        let key = format!("key:{}", caller % self.keys);
                        barrier.wait();

                        let outcome = cache.load(
                            &key,
                            || {
                                let run = loader_runs.fetch_add(1, Ordering::SeqCst) + 1;
                                thread::sleep(self.loader_delay);
                                if self.fail_every > 0 && run % self.fail_every == 0 {
                                    return Err(LoaderFailure(run));
                                }
                                Ok(format!("{key}@round{round}"))
                            },
                            self.ttl,
                        );

                        match outcome {
                            Outcome::Found(_) => found.fetch_add(1, Ordering::Relaxed),
                            Outcome::Absent => absent.fetch_add(1, Ordering::Relaxed),
                            Outcome::LoadFailed(_) => failed.fetch_add(1, Ordering::Relaxed),
                        };
                    });
                }
            });

            debug!(round, "round finished");
            cache.clear();
        }

        let report = Report {
            found: found.into_inner(),
            absent: absent.into_inner(),
            failed: failed.into_inner(),
            loader_runs: loader_runs.into_inner(),
            elapsed: start.elapsed(),
        };
        info!(
            found = report.found,
            absent = report.absent,
            failed = report.failed,
            loader_runs = report.loader_runs,
            "scenario finished"
        );
        Ok(report)
    }
}
