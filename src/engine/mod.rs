mod conflict;
mod error;
mod mutations;
mod queries;
mod store;

pub use error::EngineError;
pub use store::{IntervalStore, SharedUserState};

use std::io;
use std::path::PathBuf;

use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard};
use tracing::{error, info, warn};

use crate::limits::STORAGE_RETRY_ATTEMPTS;
use crate::model::*;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        respond_batch(batch, &result);

        // A compaction queued behind appends runs only after they are durable.
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

/// Buffer and fsync the whole batch. On any failure the batch is rolled
/// back off disk before callers hear about it, so an unacknowledged frame is
/// never replayed and a retry never lands behind a partial frame.
fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let written = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if let Err(e) = written {
        if let Err(rollback_err) = wal.rollback() {
            // Appends keep failing until a later rollback succeeds.
            error!("WAL rollback failed: {rollback_err}");
        }
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let batch = vec![(event, response)];
            let result = flush_batch(wal, &batch);
            respond_batch(batch, &result);
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

/// The booking engine: the interval store, the WAL writer handle and the
/// user-directory lock. Construct once and share as `Arc<Engine>`.
pub struct Engine {
    pub(super) store: IntervalStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Serialises user creation so the email uniqueness check and insert
    /// are atomic. Compaction takes it to freeze the user set.
    pub(super) directory: Mutex<()>,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task.
    /// Must be called inside a tokio runtime.
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        if replay.discarded_tail {
            warn!(
                "WAL {}: discarded torn tail after byte {}",
                wal_path.display(),
                replay.valid_len
            );
        }
        let wal = Wal::open_truncated(&wal_path, replay.valid_len)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = IntervalStore::from_events(&replay.events);
        info!(
            "replayed {} events from {} ({} users)",
            replay.events.len(),
            wal_path.display(),
            store.user_count()
        );

        Ok(Self {
            store,
            wal_tx,
            directory: Mutex::new(()),
        })
    }

    pub fn store(&self) -> &IntervalStore {
        &self.store
    }

    async fn wal_send(&self, event: &Event) -> io::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "WAL writer shut down"))?;
        rx.await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "WAL writer dropped response"))?
    }

    /// Durably append one event. Transient I/O failures are retried a bounded
    /// number of times; a failed attempt has already been rolled back.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let mut attempt = 1;
        loop {
            match self.wal_send(event).await {
                Ok(()) => return Ok(()),
                Err(e) if is_transient(&e) && attempt < STORAGE_RETRY_ATTEMPTS => {
                    warn!("WAL append attempt {attempt} failed, retrying: {e}");
                    attempt += 1;
                }
                Err(e) => return Err(EngineError::Storage(e.to_string())),
            }
        }
    }

    /// WAL-append then apply, under the caller's write lock on `us`.
    pub(super) async fn persist_and_apply(
        &self,
        us: &mut UserState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply(us, event);
        Ok(())
    }

    /// Lookup meeting → user, acquire that user's write lock.
    /// The meeting may be gone by the time the lock is held; callers re-check.
    pub(super) async fn resolve_meeting_write(
        &self,
        meeting_id: &MeetingId,
    ) -> Result<OwnedRwLockWriteGuard<UserState>, EngineError> {
        let us = self
            .store
            .user_for_meeting(meeting_id)
            .and_then(|uid| self.store.get_user_state(&uid))
            .ok_or(EngineError::MeetingNotFound(*meeting_id))?;
        Ok(us.write_owned().await)
    }
}
