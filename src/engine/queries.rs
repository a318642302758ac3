use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub async fn scope(&self, id: Ulid) -> Result<Scope, EngineError> {
        let sc = self.get_scope(&id).ok_or(EngineError::NotFound(id))?;
        let guard = sc.read().await;
        Ok(guard.snapshot())
    }

    /// All scopes ordered by start time, then id.
    pub async fn list_scopes(&self) -> Vec<Scope> {
        let handles: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut scopes = Vec::with_capacity(handles.len());
        for sc in handles {
            scopes.push(sc.read().await.snapshot());
        }
        scopes.sort_by_key(|s| (s.starts_at, s.id));
        scopes
    }

    /// Bookings matching the optional filters, ordered by scope then slot.
    pub async fn list_bookings(
        &self,
        scope_id: Option<Ulid>,
        device_id: Option<&str>,
    ) -> Result<Vec<Booking>, EngineError> {
        let handles: Vec<_> = match scope_id {
            Some(id) => vec![self.get_scope(&id).ok_or(EngineError::NotFound(id))?],
            None => self.state.iter().map(|e| e.value().clone()).collect(),
        };

        let mut out = Vec::new();
        for sc in handles {
            let guard = sc.read().await;
            out.extend(
                guard
                    .bookings
                    .values()
                    .filter(|b| device_id.is_none_or(|d| b.details.device_id == d))
                    .cloned(),
            );
        }
        out.sort_by_key(|b| (b.scope_id, b.slot_number));
        Ok(out)
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let scope_id = self.scope_for_entity(&id).ok_or(EngineError::NotFound(id))?;
        let sc = self.get_scope(&scope_id).ok_or(EngineError::NotFound(scope_id))?;
        let guard = sc.read().await;
        guard.find_booking(id).cloned().ok_or(EngineError::NotFound(id))
    }
}
