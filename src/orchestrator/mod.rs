//! Worker supervision, periodic-job locking, and health summary glue.
//!
//! Grounded in `main.rs`'s `DataSourceKillSwitch` + `tokio::spawn`
//! supervision idiom (restart-on-exit, backoff, structured logging) and in
//! `examples/original_source/scripts/migrate_once.py`'s lock-file pattern
//! for overlap-free periodic jobs. See DESIGN.md.

pub mod health;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Supervises a single long-running task, restarting it with exponential
/// backoff (base 1s, doubling, capped at 60s) whenever it returns an
/// error or panics, until `shutdown` is cancelled.
pub struct Supervisor {
    name: &'static str,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(name: &'static str, shutdown: CancellationToken) -> Self {
        Self { name, shutdown }
    }

    /// `make_task` is called once per attempt; it must produce a fresh
    /// future each time since a future cannot be polled after it exits.
    pub async fn run<F, Fut>(&self, mut make_task: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let mut backoff = Duration::from_secs(1);
        loop {
            if self.shutdown.is_cancelled() {
                tracing::info!(worker = self.name, "supervisor shutting down");
                return;
            }

            let result = tokio::select! {
                r = make_task() => r,
                _ = self.shutdown.cancelled() => {
                    tracing::info!(worker = self.name, "supervisor shutting down mid-run");
                    return;
                }
            };

            match result {
                Ok(()) => {
                    tracing::info!(worker = self.name, "worker exited cleanly");
                    return;
                }
                Err(err) => {
                    tracing::error!(worker = self.name, error = %err, backoff_ms = backoff.as_millis() as u64, "worker failed, restarting");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.shutdown.cancelled() => return,
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }
}

/// Overlap guard for periodic jobs: creates `path` with `O_EXCL` semantics
/// (fails if it already exists) and removes it on every exit path,
/// including panic, via `Drop`.
pub struct JobLock {
    path: PathBuf,
}

impl JobLock {
    pub fn acquire(path: impl AsRef<Path>) -> std::io::Result<Self> {
        use std::fs::OpenOptions;
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path.as_ref())?;
        Ok(Self {
            path: path.as_ref().to_path_buf(),
        })
    }
}

impl Drop for JobLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn supervisor_restarts_failing_task_until_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let shutdown = CancellationToken::new();
        let supervisor = Supervisor::new("test-worker", shutdown.clone());

        let attempts_clone = attempts.clone();
        supervisor
            .run(|| {
                let attempts = attempts_clone.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        anyhow::bail!("transient failure {n}")
                    }
                    Ok(())
                }
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn supervisor_stops_immediately_when_already_cancelled() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let supervisor = Supervisor::new("test-worker", shutdown);
        let ran = Arc::new(AtomicU32::new(0));
        let ran_clone = ran.clone();
        supervisor
            .run(|| {
                let ran = ran_clone.clone();
                async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn job_lock_rejects_concurrent_acquire_and_releases_on_drop() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("orchestrator_job_lock_test_{}", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let first = JobLock::acquire(&path).expect("first acquire should succeed");
        assert!(JobLock::acquire(&path).is_err());
        drop(first);
        assert!(JobLock::acquire(&path).is_ok());
        let _ = std::fs::remove_file(&path);
    }
}
