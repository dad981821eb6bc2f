//! Transfer executor: runs one [`SyncTask`] against the device with retries.
//!
//! ```text
//!   Pending ─▶ InFlight ─┬─▶ Succeeded
//!                        ├─▶ FailedTransient   (retried until max_attempts)
//!                        ├─▶ FailedPermanent   (never retried)
//!                        └─▶ DeviceUnavailable (caller requeues)
//! ```
//!
//! Every method blocks; the daemon calls them from `spawn_blocking`, moving
//! the executor into the closure so no second call can start meanwhile.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use picosync_core::{EngineSettings, SyncTask, TaskKey, TaskKind, TaskOrigin};
use picosync_device::{DeviceTool, FailureClass, RemoteEntry, ToolError};

use crate::error::TransferError;
use crate::ledger::{file_digest, UploadLedger};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Base delay; attempt `n` waits `n * backoff` before the next one.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&EngineSettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(engine: &EngineSettings) -> Self {
        Self {
            max_attempts: engine.max_attempts.max(1),
            backoff: engine.retry_backoff(),
        }
    }

    fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff * attempt
    }
}

/// Result of a successful [`TransferExecutor::execute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Tool invocations of the main operation (0 when skipped).
    pub attempts: u32,
    /// The device already held identical content.
    pub skipped: bool,
}

pub struct TransferExecutor {
    tool: Arc<dyn DeviceTool>,
    policy: RetryPolicy,
    ledger: UploadLedger,
    created_dirs: HashSet<TaskKey>,
}

impl TransferExecutor {
    pub fn new(tool: Arc<dyn DeviceTool>, policy: RetryPolicy) -> Self {
        Self {
            tool,
            policy,
            ledger: UploadLedger::new(),
            created_dirs: HashSet::new(),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn tool(&self) -> &Arc<dyn DeviceTool> {
        &self.tool
    }

    /// Drop per-connection knowledge of the device (new board or re-plug).
    pub fn forget_connection(&mut self) {
        self.ledger.clear();
        self.created_dirs.clear();
    }

    pub fn execute(&mut self, task: &SyncTask, port: &str) -> Result<TransferOutcome, TransferError> {
        match task.kind {
            TaskKind::Upload => self.upload(task, port),
            TaskKind::Delete => self.delete(task, port),
        }
    }

    fn upload(&mut self, task: &SyncTask, port: &str) -> Result<TransferOutcome, TransferError> {
        let digest = file_digest(&task.path).map_err(|e| TransferError::Permanent {
            reason: e.to_string(),
        })?;
        if task.origin == TaskOrigin::Watcher && self.ledger.is_current(&task.key, &digest) {
            tracing::debug!("{} unchanged since last upload, skipping", task.key);
            return Ok(TransferOutcome {
                attempts: 0,
                skipped: true,
            });
        }

        for dir in task.key.parent_dirs() {
            if self.created_dirs.contains(&dir) {
                continue;
            }
            let remote = dir.remote_path();
            self.with_retry("mkdir", &dir, || match self.tool.make_dir(port, &remote) {
                Err(err) if err.is_already_exists() => Ok(()),
                other => other,
            })?;
            self.created_dirs.insert(dir);
        }

        let remote = task.key.remote_path();
        let ((), attempts) = self.with_retry("upload", &task.key, || {
            self.tool.copy_file(port, &task.path, &remote)
        })?;
        self.ledger.record(task.key.clone(), digest);
        tracing::info!("uploaded {} ({attempts} attempt(s))", task.key);
        Ok(TransferOutcome {
            attempts,
            skipped: false,
        })
    }

    fn delete(&mut self, task: &SyncTask, port: &str) -> Result<TransferOutcome, TransferError> {
        let remote = task.key.remote_path();
        let ((), attempts) = self.with_retry("delete", &task.key, || {
            match self.tool.remove_path(port, &remote) {
                Err(err) if err.is_remote_missing() => Ok(()),
                other => other,
            }
        })?;
        self.forget_remote(&task.key);
        tracing::info!("deleted {} ({attempts} attempt(s))", task.key);
        Ok(TransferOutcome {
            attempts,
            skipped: false,
        })
    }

    /// Remove `key` on request. Unlike a queued Delete, a remote path that
    /// does not exist is reported as a failure.
    pub fn remove_remote(&mut self, port: &str, key: &TaskKey) -> Result<(), TransferError> {
        let remote = key.remote_path();
        self.with_retry("rm", key, || self.tool.remove_path(port, &remote))?;
        self.forget_remote(key);
        tracing::info!("removed {key} from the device");
        Ok(())
    }

    fn forget_remote(&mut self, key: &TaskKey) {
        self.ledger.forget(key);
        self.created_dirs
            .retain(|dir| dir != key && !dir.is_inside(key));
    }

    /// Soft-reset the board. Explicit only; never implied by a task.
    pub fn reset_device(&mut self, port: &str) -> Result<(), TransferError> {
        let key = TaskKey::from(":");
        self.with_retry("reset", &key, || self.tool.reset(port))?;
        Ok(())
    }

    /// Remove every regular file in the device root.
    pub fn wipe(&mut self, port: &str) -> Result<(), TransferError> {
        let key = TaskKey::from(":");
        self.with_retry("wipe", &key, || self.tool.wipe(port))?;
        self.forget_connection();
        Ok(())
    }

    /// List a remote directory; `None` lists the device root.
    pub fn list_remote(
        &mut self,
        port: &str,
        dir: Option<&TaskKey>,
    ) -> Result<Vec<RemoteEntry>, TransferError> {
        let remote = dir.map(TaskKey::remote_path).unwrap_or_else(|| ":".to_string());
        let key = dir.cloned().unwrap_or_else(|| TaskKey::from(":"));
        let (entries, _) = self.with_retry("ls", &key, || self.tool.list_dir(port, &remote))?;
        Ok(entries)
    }

    /// The firmware's machine string.
    pub fn machine(&mut self, port: &str) -> Result<String, TransferError> {
        let key = TaskKey::from(":");
        let (machine, _) = self.with_retry("machine", &key, || self.tool.machine(port))?;
        Ok(machine)
    }

    fn with_retry<T>(
        &self,
        operation: &str,
        key: &TaskKey,
        mut call: impl FnMut() -> Result<T, ToolError>,
    ) -> Result<(T, u32), TransferError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match call() {
                Ok(value) => return Ok((value, attempt)),
                Err(err) => err,
            };
            let reason = err.to_string();
            match err.classify() {
                FailureClass::DeviceUnavailable => {
                    return Err(TransferError::DeviceUnavailable { reason });
                }
                FailureClass::Permanent => {
                    tracing::warn!("{operation} {key} failed permanently: {reason}");
                    return Err(TransferError::Permanent { reason });
                }
                FailureClass::Transient if attempt >= self.policy.max_attempts => {
                    tracing::warn!("{operation} {key} gave up after {attempt} attempts: {reason}");
                    return Err(TransferError::Transient {
                        attempts: attempt,
                        reason,
                    });
                }
                FailureClass::Transient => {
                    let delay = self.policy.delay_after(attempt);
                    tracing::debug!(
                        "{operation} {key} attempt {attempt} failed ({reason}), retrying in {delay:?}"
                    );
                    std::thread::sleep(delay);
                }
            }
        }
    }
}

impl std::fmt::Debug for TransferExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferExecutor")
            .field("policy", &self.policy)
            .field("ledger", &self.ledger.len())
            .field("created_dirs", &self.created_dirs.len())
            .finish()
    }
}
