// Durable persistence synchronizer
//
// Debounces local mutations and writes the whole document to the durable
// store. One flush at most is in flight per session; arms that arrive while
// flushing are handled once it returns.

use crate::dirty::DirtySnapshot;
use crate::error::{StoreError, SyncError, SyncResult};
use crate::session::{SessionEvent, Shared};
use crate::transport::DurableStore;
use protocol::Document;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};

/// Save progress as shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaveState {
    /// Nothing has been flushed yet
    Idle,
    Saving,
    Saved,
    /// Retries exhausted; edits stay dirty until the next mutation re-arms
    OfflinePending,
}

pub(crate) enum FlushCommand {
    /// A local mutation happened: restart the debounce timer
    Arm,
    /// Flush immediately and report the outcome
    FlushNow(oneshot::Sender<SyncResult<()>>),
}

pub(crate) struct Synchronizer {
    shared: Arc<Shared>,
    store: Arc<dyn DurableStore>,
    commands: mpsc::UnboundedReceiver<FlushCommand>,
}

impl Synchronizer {
    pub(crate) fn new(
        shared: Arc<Shared>,
        store: Arc<dyn DurableStore>,
        commands: mpsc::UnboundedReceiver<FlushCommand>,
    ) -> Self {
        Synchronizer {
            shared,
            store,
            commands,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut deadline: Option<Instant> = None;
        let mut attempt: u32 = 0;

        loop {
            let timer = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(FlushCommand::Arm) => {
                        attempt = 0;
                        deadline = Some(Instant::now() + self.shared.sync.debounce);
                    }
                    Some(FlushCommand::FlushNow(ack)) => {
                        deadline = None;
                        attempt = 0;
                        let result = self.flush().await;
                        if result.is_err() {
                            self.set_save_state(SaveState::OfflinePending);
                        }
                        let _ = ack.send(result);
                    }
                    None => break,
                },
                _ = timer => {
                    deadline = None;
                    if self.flush().await.is_ok() {
                        attempt = 0;
                    } else if attempt < self.shared.sync.max_retries {
                        attempt += 1;
                        let backoff = self.shared.sync.backoff_for(attempt);
                        tracing::warn!(
                            "Flush attempt {} for {} failed, retrying in {:?}",
                            attempt,
                            self.shared.session,
                            backoff
                        );
                        deadline = Some(Instant::now() + backoff);
                    } else {
                        tracing::error!(
                            "Flush for {} failed after {} retries; edits stay pending",
                            self.shared.session,
                            attempt
                        );
                        attempt = 0;
                        self.set_save_state(SaveState::OfflinePending);
                    }
                }
            }
        }
    }

    /// Write the current document if anything is dirty.
    ///
    /// Only the dirty entries captured here are cleared on success; a failure
    /// leaves every field dirty.
    async fn flush(&self) -> SyncResult<()> {
        let (document, snapshot) = {
            let mut state = self.shared.state.lock();
            if state.dirty.is_empty() {
                return Ok(());
            }
            state.syncing = true;
            (state.store.document().clone(), state.dirty.snapshot())
        };
        self.set_save_state(SaveState::Saving);

        let result = self.store.upsert(&self.shared.session, &document).await;
        self.finish(document, &snapshot, result)
    }

    fn finish(
        &self,
        document: Document,
        snapshot: &DirtySnapshot,
        result: Result<(), StoreError>,
    ) -> SyncResult<()> {
        let mut state = self.shared.state.lock();
        state.syncing = false;

        match result {
            Ok(()) => {
                let cleared = state.dirty.clear_confirmed(snapshot);
                state.last_flushed = Some(document);
                state.last_error = None;
                state.save_state = SaveState::Saved;
                drop(state);

                tracing::info!(
                    "Flushed {} ({} of {} dirty fields confirmed)",
                    self.shared.session,
                    cleared,
                    snapshot.len()
                );
                self.shared.emit(SessionEvent::SaveState(SaveState::Saved));
                Ok(())
            }
            Err(e) => {
                let error = SyncError::from(e);
                state.last_error = Some(error.clone());
                drop(state);

                tracing::warn!(
                    "Flush of {} failed, keeping {:?} dirty: {}",
                    self.shared.session,
                    snapshot.fields().collect::<Vec<_>>(),
                    error
                );
                self.shared.emit(SessionEvent::Error(error.clone()));
                Err(error)
            }
        }
    }

    fn set_save_state(&self, save_state: SaveState) {
        self.shared.state.lock().save_state = save_state;
        self.shared.emit(SessionEvent::SaveState(save_state));
    }
}
