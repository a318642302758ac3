mod error;
mod mutations;
mod queries;
mod slot_store;
mod validate;

pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedScopeState = Arc<RwLock<ScopeState>>;

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

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that arrive while a flush is pending share one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
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
        if let Err(ref e) = result {
            tracing::error!("WAL flush failed for {} events: {e}", batch.len());
        }
        for (_, tx) in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let append_result = batch.iter().try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so stray buffered bytes do not leak
    // into the next batch.
    let flush_result = wal.flush_sync();
    append_result.and(flush_result)
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
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// The booking store: one lock per scope, every change durably logged before
/// it becomes visible.
pub struct Engine {
    pub state: DashMap<Ulid, SharedScopeState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: booking or break id → scope id.
    pub(super) entity_to_scope: DashMap<Ulid, Ulid>,
}

/// Apply an event to a scope the caller has locked.
fn apply_to_scope(sc: &mut ScopeState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::BreakAdded { id, scope_id, span } => {
            sc.insert_break(Break { id: *id, span: *span });
            entity_map.insert(*id, *scope_id);
        }
        Event::BreakRemoved { id, .. } => {
            sc.remove_break(*id);
            entity_map.remove(id);
        }
        Event::BookingCreated { booking } => {
            sc.bookings.insert(booking.slot_number, booking.clone());
            entity_map.insert(booking.id, booking.scope_id);
        }
        Event::BookingDeleted { id, .. } => {
            sc.remove_booking(*id);
            entity_map.remove(id);
        }
        Event::PaymentStatusChanged { id, status, .. } => {
            if let Some(b) = sc.find_booking_mut(*id) {
                b.details.payment_status = *status;
            }
        }
        // Scope creation and deletion touch the map, not a scope.
        Event::ScopeCreated { .. } | Event::ScopeDeleted { .. } => {}
    }
}

/// Scope an event belongs to, for everything except create/delete.
fn event_scope_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::BreakAdded { scope_id, .. }
        | Event::BreakRemoved { scope_id, .. }
        | Event::BookingDeleted { scope_id, .. }
        | Event::PaymentStatusChanged { scope_id, .. } => Some(*scope_id),
        Event::BookingCreated { booking } => Some(booking.scope_id),
        Event::ScopeCreated { .. } | Event::ScopeDeleted { .. } => None,
    }
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task. Must be called
    /// inside a Tokio runtime.
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            entity_to_scope: DashMap::new(),
        };

        // Nothing else holds these Arcs yet, so try_write always succeeds.
        // Never block here: this may run inside the runtime.
        for event in &events {
            match event {
                Event::ScopeCreated { id, kind, name, capacity, starts_at, slot_minutes } => {
                    let sc = ScopeState::new(*id, *kind, name.clone(), *capacity, *starts_at, *slot_minutes);
                    engine.state.insert(*id, Arc::new(RwLock::new(sc)));
                }
                Event::ScopeDeleted { id } => {
                    engine.state.remove(id);
                }
                other => {
                    if let Some(scope_id) = event_scope_id(other)
                        && let Some(entry) = engine.state.get(&scope_id) {
                            let sc = entry.clone();
                            let Ok(mut guard) = sc.try_write() else {
                                return Err(io::Error::other("replay: scope locked"));
                            };
                            apply_to_scope(&mut guard, other, &engine.entity_to_scope);
                        }
                }
            }
        }
        metrics::gauge!(crate::observability::SCOPES_ACTIVE).set(engine.state.len() as f64);
        tracing::info!(
            "replayed {} events into {} scopes from {}",
            events.len(),
            engine.state.len(),
            wal_path.display()
        );

        Ok(engine)
    }

    /// Hand an event to the group-commit writer and wait until it is durable.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_scope(&self, id: &Ulid) -> Option<SharedScopeState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn scope_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_scope.get(entity_id).map(|e| *e.value())
    }

    /// WAL-append, apply, notify.
    pub(super) async fn persist_and_apply(
        &self,
        scope_id: Ulid,
        sc: &mut ScopeState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_scope(sc, event, &self.entity_to_scope);
        self.notify.send(scope_id, event);
        Ok(())
    }

    /// Lookup entity → scope, acquire the scope's write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<ScopeState>), EngineError> {
        let scope_id = self
            .scope_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let sc = self
            .get_scope(&scope_id)
            .ok_or(EngineError::NotFound(scope_id))?;
        let guard = sc.clone().write_owned().await;
        self.ensure_live(scope_id, &sc)?;
        Ok((scope_id, guard))
    }
}
