use crate::bank::facade::Bank;
use crate::codec::record::RecordCodec;
use crate::core::error::{Error, Result};
use crate::indexing::discovery::relative_key;
use crate::indexing::progress::Progress;
use crate::indexing::updater::UpdateOptions;
use notify_debouncer_full::{
    new_debouncer,
    notify::{RecursiveMode, Watcher},
    DebounceEventResult, DebouncedEvent,
};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::time::Duration;

/// How often the watch loop checks for shutdown while idle
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What a batch of file-system events asks the index to do
#[derive(Debug, Default, PartialEq)]
pub(crate) struct PendingChanges {
    /// Bank-relative record files to re-index
    pub(crate) paths: BTreeSet<String>,
    /// Something vanished that was not a record file, e.g. a directory
    pub(crate) needs_full_update: bool,
}

/// Keeps a bank's index current while files change on disk
pub struct BankWatcher<C: RecordCodec> {
    bank: Arc<Bank<C>>,
    debounce: Duration,
}

impl<C: RecordCodec + 'static> BankWatcher<C> {
    pub fn new(bank: Arc<Bank<C>>) -> Self {
        Self {
            bank,
            debounce: Duration::from_secs(2),
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Watch the bank directory until `shutdown` fires or its sender is dropped
    pub fn watch(&self, shutdown: Receiver<()>) -> Result<()> {
        let root = self.bank.path().to_path_buf();
        if !root.is_dir() {
            return Err(Error::MissingDirectory(root));
        }
        let canonical = root.canonicalize()?;

        let (tx, rx) = mpsc::channel();
        let mut debouncer = new_debouncer(self.debounce, None, move |result: DebounceEventResult| {
            let _ = tx.send(result);
        })
        .map_err(|e| Error::Config(format!("Failed to create file watcher: {}", e)))?;

        debouncer
            .watcher()
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| Error::Config(format!("Failed to watch directory: {}", e)))?;
        tracing::info!("Watching {}", root.display());

        loop {
            match shutdown.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(Ok(events)) => {
                    let roots = [canonical.as_path(), root.as_path()];
                    let changes = self.collect_changes(&events, &roots);
                    self.apply(changes);
                }
                Ok(Err(errors)) => {
                    for e in errors {
                        tracing::warn!("File watcher error: {}", e);
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        tracing::info!("Stopped watching {}", root.display());
        Ok(())
    }

    pub(crate) fn collect_changes(
        &self,
        events: &[DebouncedEvent],
        roots: &[&Path],
    ) -> PendingChanges {
        let config = self.bank.config();
        let mut changes = PendingChanges::default();

        for event in events {
            for path in &event.paths {
                let Some(relative) = roots.iter().find_map(|root| relative_key(root, path)) else {
                    continue;
                };
                if config.is_excluded(path) || path.is_dir() {
                    continue;
                }
                if !config.include_hidden && relative.split('/').any(|part| part.starts_with('.')) {
                    continue;
                }
                if self.bank.codec().accepts(path) {
                    changes.paths.insert(relative);
                } else if !path.exists() {
                    changes.needs_full_update = true;
                }
            }
        }
        changes
    }

    fn apply(&self, changes: PendingChanges) {
        let result = if changes.needs_full_update {
            self.bank
                .update_index_with(UpdateOptions::default(), Progress::Disabled)
        } else if changes.paths.is_empty() {
            return;
        } else {
            let paths: Vec<String> = changes.paths.into_iter().collect();
            self.bank.update_paths(&paths)
        };

        match result {
            Ok(report) if report.changed() => tracing::info!(
                "Index updated: {} added, {} updated, {} removed",
                report.added,
                report.updated,
                report.removed
            ),
            Ok(_) => tracing::debug!("No index changes"),
            Err(e) => tracing::warn!("Failed to update index: {}", e),
        }
    }
}
