use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::validate::{check_slot_free, now_ms, validate_break, validate_details, validate_scope};
use super::{Engine, EngineError, SharedScopeState, WalCommand};

impl Engine {
    pub async fn create_scope(
        &self,
        id: Ulid,
        kind: ScopeKind,
        name: Option<String>,
        capacity: u32,
        starts_at: Ms,
        slot_minutes: u32,
    ) -> Result<(), EngineError> {
        if self.state.len() >= MAX_SCOPES {
            return Err(EngineError::LimitExceeded("too many scopes"));
        }
        validate_scope(name.as_deref(), capacity, starts_at, slot_minutes)?;
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ScopeCreated {
            id,
            kind,
            name: name.clone(),
            capacity,
            starts_at,
            slot_minutes,
        };
        self.wal_append(&event).await?;
        let sc = ScopeState::new(id, kind, name, capacity, starts_at, slot_minutes);
        self.state.insert(id, Arc::new(RwLock::new(sc)));
        metrics::gauge!(crate::observability::SCOPES_ACTIVE).set(self.state.len() as f64);
        self.notify.send(id, &event);
        tracing::info!(scope = %id, %kind, capacity, "scope created");
        Ok(())
    }

    /// Only empty scopes can be deleted; bookings must be removed first.
    pub async fn delete_scope(&self, id: Ulid) -> Result<(), EngineError> {
        let sc = self.get_scope(&id).ok_or(EngineError::NotFound(id))?;
        let guard = sc.write().await;
        self.ensure_live(id, &sc)?;
        if !guard.bookings.is_empty() {
            return Err(EngineError::HasBookings(id));
        }

        let event = Event::ScopeDeleted { id };
        self.wal_append(&event).await?;
        for brk in &guard.breaks {
            self.entity_to_scope.remove(&brk.id);
        }
        self.state.remove(&id);
        drop(guard);
        metrics::gauge!(crate::observability::SCOPES_ACTIVE).set(self.state.len() as f64);
        self.notify.send(id, &event);
        self.notify.remove(&id);
        Ok(())
    }

    /// Breaks within one scope may not overlap.
    pub async fn add_break(&self, id: Ulid, scope_id: Ulid, span: Span) -> Result<(), EngineError> {
        validate_break(&span)?;
        if self.entity_to_scope.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let sc = self.get_scope(&scope_id).ok_or(EngineError::NotFound(scope_id))?;
        let mut guard = sc.write().await;
        self.ensure_live(scope_id, &sc)?;
        if guard.breaks.len() >= MAX_BREAKS_PER_SCOPE {
            return Err(EngineError::LimitExceeded("too many breaks on scope"));
        }
        if let Some(existing) = guard.overlapping_break(&span) {
            return Err(EngineError::BreakOverlap {
                existing: existing.id,
                span,
            });
        }

        let event = Event::BreakAdded { id, scope_id, span };
        self.persist_and_apply(scope_id, &mut guard, &event).await
    }

    pub async fn remove_break(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (scope_id, mut guard) = self.resolve_entity_write(&id).await?;
        if !guard.breaks.iter().any(|b| b.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::BreakRemoved { id, scope_id };
        self.persist_and_apply(scope_id, &mut guard, &event).await?;
        Ok(scope_id)
    }

    /// Persist a booking at an exact slot. The range and uniqueness checks,
    /// the WAL append and the in-memory apply all happen under the scope's
    /// write lock, so two inserts for the same slot can never both succeed.
    pub async fn insert_booking(&self, new: NewBooking) -> Result<Booking, EngineError> {
        validate_details(&new.details)?;
        let sc = self
            .get_scope(&new.scope_id)
            .ok_or(EngineError::NotFound(new.scope_id))?;
        let mut guard = sc.write().await;
        self.ensure_live(new.scope_id, &sc)?;
        check_slot_free(&guard, new.slot_number)?;

        let booking = Booking {
            id: Ulid::new(),
            scope_id: new.scope_id,
            slot_number: new.slot_number,
            approximate_time: new.approximate_time,
            details: new.details,
            created_at: now_ms(),
        };
        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        self.persist_and_apply(new.scope_id, &mut guard, &event).await?;
        Ok(booking)
    }

    /// Remove a booking; its slot becomes free for gap-filling allocation.
    pub async fn delete_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let (scope_id, mut guard) = self.resolve_entity_write(&id).await?;
        let booking = guard.find_booking(id).cloned().ok_or(EngineError::NotFound(id))?;
        let event = Event::BookingDeleted { id, scope_id };
        self.persist_and_apply(scope_id, &mut guard, &event).await?;
        tracing::info!(scope = %scope_id, slot = booking.slot_number, "booking {id} deleted");
        Ok(booking)
    }

    pub async fn set_payment_status(&self, id: Ulid, status: PaymentStatus) -> Result<Booking, EngineError> {
        let (scope_id, mut guard) = self.resolve_entity_write(&id).await?;
        let current = guard.find_booking(id).ok_or(EngineError::NotFound(id))?;
        if current.details.payment_status == status {
            return Ok(current.clone());
        }
        let event = Event::PaymentStatusChanged { id, scope_id, status };
        self.persist_and_apply(scope_id, &mut guard, &event).await?;
        guard.find_booking(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// The state we locked must still be the one registered under `scope_id`.
    /// A scope deleted (and possibly re-created) while we waited is gone for good.
    pub(super) fn ensure_live(&self, scope_id: Ulid, locked: &SharedScopeState) -> Result<(), EngineError> {
        match self.state.get(&scope_id) {
            Some(current) if Arc::ptr_eq(current.value(), locked) => Ok(()),
            _ => Err(EngineError::NotFound(scope_id)),
        }
    }

    /// Rewrite the WAL with only the events needed to rebuild current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();
        let scopes: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        for sc in scopes {
            let guard = sc.read().await;
            events.push(Event::ScopeCreated {
                id: guard.id,
                kind: guard.kind,
                name: guard.name.clone(),
                capacity: guard.capacity,
                starts_at: guard.starts_at,
                slot_minutes: guard.slot_minutes,
            });
            events.extend(guard.breaks.iter().map(|b| Event::BreakAdded {
                id: b.id,
                scope_id: guard.id,
                span: b.span,
            }));
            events.extend(guard.bookings.values().map(|b| Event::BookingCreated {
                booking: b.clone(),
            }));
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
