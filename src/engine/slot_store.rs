use async_trait::async_trait;
use ulid::Ulid;

use crate::allocator::{InsertError, SlotStore, StoreError};
use crate::model::{Booking, NewBooking};

use super::{Engine, EngineError};

impl From<EngineError> for StoreError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::NotFound(id) => StoreError::ScopeNotFound(id),
            EngineError::WalError(msg) => StoreError::Unavailable(msg),
            other => StoreError::Rejected(other.to_string()),
        }
    }
}

/// The engine as the allocator's backing store. Each call takes the scope's
/// lock on its own, so reads and the insert are separate steps and a
/// concurrent request can claim a slot in between.
#[async_trait]
impl SlotStore for Engine {
    async fn occupied_slots(&self, scope_id: Ulid) -> Result<Vec<u32>, StoreError> {
        let sc = self
            .get_scope(&scope_id)
            .ok_or(StoreError::ScopeNotFound(scope_id))?;
        let guard = sc.read().await;
        Ok(guard.occupied_slots())
    }

    async fn max_slot(&self, scope_id: Ulid) -> Result<Option<u32>, StoreError> {
        let sc = self
            .get_scope(&scope_id)
            .ok_or(StoreError::ScopeNotFound(scope_id))?;
        let guard = sc.read().await;
        Ok(guard.max_slot())
    }

    async fn insert_booking(&self, booking: NewBooking) -> Result<Booking, InsertError> {
        match Engine::insert_booking(self, booking).await {
            Ok(b) => Ok(b),
            Err(EngineError::SlotTaken { scope_id, slot_number }) => {
                Err(InsertError::Duplicate { scope_id, slot_number })
            }
            Err(e) => Err(InsertError::Failed(e.into())),
        }
    }
}
