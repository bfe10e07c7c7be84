//! Provider and callback traits
//!
//! These traits let the declarative crate drive a remote API, report
//! progress and ask for confirmation without depending on a specific
//! cloud SDK or terminal UI.

use crate::error::{Error, ProviderError};
use crate::resource::FileContent;
use crate::retry::{RetryConfig, with_retry};
use crate::state::{RemoteResourceState, StateStore};
use crate::types::{ApplyResult, Attributes, ResourceId, ResourceKind};
use anyhow::{Context as _, Result};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

/// What a successful create returns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created {
    /// Identifier assigned by the remote system
    pub remote_id: String,
    /// Attributes as the remote system reports them, computed outputs included
    pub attributes: Attributes,
}

/// The remote API, one call per resource operation
///
/// Calls block until the remote system answers. They may be retried, so
/// implementations should tolerate being called more than once, but the
/// executor never issues a create for an identity that already has state.
pub trait Provider: Send + Sync {
    /// Create a remote object from fully resolved attributes
    fn create(&self, kind: ResourceKind, attributes: &Attributes) -> Result<Created, ProviderError>;

    /// Read a remote object; [`ProviderError::NotFound`] if it is gone
    fn read(&self, kind: ResourceKind, remote_id: &str) -> Result<Attributes, ProviderError>;

    /// Update a remote object in place
    fn update(
        &self,
        kind: ResourceKind,
        remote_id: &str,
        attributes: &Attributes,
    ) -> Result<Attributes, ProviderError>;

    /// Delete a remote object
    fn delete(&self, kind: ResourceKind, remote_id: &str) -> Result<(), ProviderError>;
}

/// Loads file-content attribute values as opaque bytes
pub trait FileLoader {
    fn load(&self, path: &Path) -> Result<FileContent>;
}

/// Reads files straight from the filesystem
pub struct FsLoader;

impl FileLoader for FsLoader {
    fn load(&self, path: &Path) -> Result<FileContent> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(FileContent::new(path, bytes))
    }
}

/// Stage of a run, reported to [`ProgressCallback::on_batch_start`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Deleting state entries that are no longer declared
    Prune,
    /// Deleting resources that will be recreated
    Teardown,
    Apply,
    Destroy,
    Refresh,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Prune => "Removing undeclared resources",
            Self::Teardown => "Removing resources to replace",
            Self::Apply => "Applying",
            Self::Destroy => "Destroying",
            Self::Refresh => "Refreshing",
        };
        f.write_str(name)
    }
}

/// Progress callback for execution operations
///
/// Callbacks are invoked from the scheduling thread only, in the order
/// nodes start and finish.
pub trait ProgressCallback: Send {
    /// Called when a phase with `count` nodes begins
    fn on_batch_start(&mut self, count: usize, phase: Phase);

    /// Called when a node's provider work is dispatched
    fn on_resource_start(&mut self, id: &ResourceId, description: &str);

    /// Called when a node finishes, successfully or not
    fn on_resource_complete(&mut self, id: &ResourceId, result: &ApplyResult);

    /// Called when a phase completes
    fn on_batch_complete(&mut self);
}

/// Confirmation callback for user interaction
pub trait ConfirmCallback: Send {
    /// Ask the user to confirm an action
    ///
    /// # Returns
    /// `true` if the user confirmed, `false` otherwise
    fn confirm(&mut self, prompt: &str) -> Result<bool>;
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_batch_start(&mut self, _count: usize, _phase: Phase) {}
    fn on_resource_start(&mut self, _id: &ResourceId, _description: &str) {}
    fn on_resource_complete(&mut self, _id: &ResourceId, _result: &ApplyResult) {}
    fn on_batch_complete(&mut self) {}
}

/// Auto-confirm callback (always returns true)
pub struct AutoConfirm;

impl ConfirmCallback for AutoConfirm {
    fn confirm(&mut self, _prompt: &str) -> Result<bool> {
        Ok(true)
    }
}

/// Auto-decline callback (always returns false)
pub struct AutoDecline;

impl ConfirmCallback for AutoDecline {
    fn confirm(&mut self, _prompt: &str) -> Result<bool> {
        Ok(false)
    }
}

/// Shared flag a user-facing layer raises to stop scheduling new nodes
///
/// Calls already in flight run to completion.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything a node task needs to talk to the outside world
#[derive(Clone, Copy)]
pub struct ApplyContext<'a> {
    pub provider: &'a dyn Provider,
    pub state: &'a dyn StateStore,
    pub retry: &'a RetryConfig,
}

impl<'a> ApplyContext<'a> {
    pub fn new(provider: &'a dyn Provider, state: &'a dyn StateStore, retry: &'a RetryConfig) -> Self {
        Self {
            provider,
            state,
            retry,
        }
    }

    pub fn create(&self, id: &ResourceId, attributes: &Attributes) -> Result<Created, ProviderError> {
        with_retry(self.retry, &format!("{id}: create"), || {
            self.provider.create(id.kind, attributes)
        })
    }

    pub fn read(&self, id: &ResourceId, remote_id: &str) -> Result<Attributes, ProviderError> {
        with_retry(self.retry, &format!("{id}: read"), || {
            self.provider.read(id.kind, remote_id)
        })
    }

    pub fn update(
        &self,
        id: &ResourceId,
        remote_id: &str,
        attributes: &Attributes,
    ) -> Result<Attributes, ProviderError> {
        with_retry(self.retry, &format!("{id}: update"), || {
            self.provider.update(id.kind, remote_id, attributes)
        })
    }

    pub fn delete(&self, id: &ResourceId, remote_id: &str) -> Result<(), ProviderError> {
        with_retry(self.retry, &format!("{id}: delete"), || {
            self.provider.delete(id.kind, remote_id)
        })
    }

    /// Record an object the provider just created, retrying failed writes.
    ///
    /// The object already exists remotely, so giving up is reported as
    /// [`Error::UnrecordedCreate`] with its remote id rather than as a
    /// plain state store error.
    pub fn record_created(&self, entry: &RemoteResourceState) -> crate::error::Result<()> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            match self.state.put(entry.clone()) {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 >= max_attempts => {
                    return Err(Error::UnrecordedCreate {
                        resource: entry.id.clone(),
                        remote_id: entry.remote_id.clone(),
                        message: e.to_string(),
                    });
                }
                Err(e) => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    log::warn!(
                        "{}: recording state failed ({e}), retrying in {delay:?}",
                        entry.id
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_signal_is_shared() {
        let signal = AbortSignal::new();
        let handle = signal.clone();
        assert!(!signal.is_aborted());
        handle.abort();
        assert!(signal.is_aborted());
    }

    #[test]
    fn test_fs_loader_missing_file() {
        let err = FsLoader
            .load(Path::new("/definitely/not/here.json"))
            .unwrap_err();
        assert!(err.to_string().contains("here.json"));
    }
}
