//! Slot assignment under concurrent booking requests.
//!
//! Every attempt re-reads the scope's taken slots from the store, picks a
//! candidate with the requested [`AllocationPolicy`] and tries to insert it.
//! The store's uniqueness check on `(scope_id, slot_number)` is the only
//! arbiter between racing requests; a lost race costs one more attempt, up to
//! a fixed budget. Nothing is cached between attempts.

mod error;
mod policy;
pub mod projector;
mod store;
#[cfg(test)]
mod tests;

pub use error::AllocationError;
pub use policy::{first_gap, next_after, AllocationPolicy};
pub use projector::project;
pub use store::{InsertError, SlotStore, StoreError};

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::limits::DEFAULT_RETRY_BUDGET;
use crate::model::{Booking, BookingDetails, NewBooking, Scope, MINUTE_MS};
use crate::observability;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// Insert attempts per request. Values below 1 are treated as 1.
    pub retry_budget: u32,
    /// Overall time allowed per request, checked between attempts.
    pub timeout: Option<Duration>,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            retry_budget: DEFAULT_RETRY_BUDGET,
            timeout: None,
        }
    }
}

pub struct SlotAllocator<S> {
    store: Arc<S>,
    config: AllocatorConfig,
}

impl<S> Clone for SlotAllocator<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            config: self.config,
        }
    }
}

impl<S: SlotStore> SlotAllocator<S> {
    pub fn new(store: Arc<S>, config: AllocatorConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> AllocatorConfig {
        self.config
    }

    /// Claim a slot in `scope` and persist the booking.
    pub async fn allocate(
        &self,
        scope: &Scope,
        details: BookingDetails,
        policy: AllocationPolicy,
    ) -> Result<Booking, AllocationError> {
        let started = Instant::now();
        let deadline = self.config.timeout.map(|t| started + t);
        let budget = self.config.retry_budget.max(1);

        let result = self.run_attempts(scope, details, policy, budget, deadline).await;

        let outcome = match &result {
            Ok((booking, attempts)) => {
                info!(
                    scope = %scope.id,
                    slot = booking.slot_number,
                    %policy,
                    attempts,
                    "booking {} allocated",
                    booking.id
                );
                metrics::histogram!(observability::ALLOCATION_ATTEMPTS).record(*attempts as f64);
                "ok"
            }
            Err(AllocationError::ScopeFull { .. }) => "full",
            Err(e @ AllocationError::Contention { .. }) => {
                warn!(scope = %scope.id, %policy, "{e}");
                metrics::histogram!(observability::ALLOCATION_ATTEMPTS).record(budget as f64);
                "contention"
            }
            Err(e @ AllocationError::Storage(_)) => {
                warn!(scope = %scope.id, %policy, "{e}");
                "storage_error"
            }
        };
        metrics::counter!(
            observability::ALLOCATIONS_TOTAL,
            "policy" => policy.as_str(),
            "outcome" => outcome
        )
        .increment(1);
        metrics::histogram!(observability::ALLOCATION_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());

        result.map(|(booking, _)| booking)
    }

    async fn run_attempts(
        &self,
        scope: &Scope,
        details: BookingDetails,
        policy: AllocationPolicy,
        budget: u32,
        deadline: Option<Instant>,
    ) -> Result<(Booking, u32), AllocationError> {
        for attempt in 1..=budget {
            if attempt > 1
                && let Some(deadline) = deadline
                && Instant::now() >= deadline {
                    return Err(StoreError::DeadlineExceeded.into());
                }

            let slot_number = self.candidate(scope, policy).await?;
            let approximate_time = policy.projects_time().then(|| {
                project(
                    slot_number,
                    scope.starts_at,
                    scope.slot_minutes as i64 * MINUTE_MS,
                    &scope.breaks,
                )
            });

            let new = NewBooking {
                scope_id: scope.id,
                slot_number,
                approximate_time,
                details: details.clone(),
            };
            match self.store.insert_booking(new).await {
                Ok(booking) => return Ok((booking, attempt)),
                Err(InsertError::Duplicate { slot_number, .. }) => {
                    debug!(scope = %scope.id, slot_number, attempt, "slot claimed concurrently, retrying");
                    metrics::counter!(observability::ALLOCATION_CONFLICTS_TOTAL).increment(1);
                }
                Err(InsertError::Failed(e)) => return Err(e.into()),
            }
        }
        Err(AllocationError::Contention {
            scope_id: scope.id,
            attempts: budget,
        })
    }

    /// Re-read the scope and compute the next slot under `policy`.
    async fn candidate(&self, scope: &Scope, policy: AllocationPolicy) -> Result<u32, AllocationError> {
        let candidate = match policy {
            AllocationPolicy::GapFilling => {
                let occupied = self.store.occupied_slots(scope.id).await?;
                first_gap(&occupied, scope.capacity)
            }
            AllocationPolicy::Sequential => {
                let max = self.store.max_slot(scope.id).await?;
                next_after(max, scope.capacity)
            }
        };
        candidate.ok_or(AllocationError::ScopeFull {
            scope_id: scope.id,
            capacity: scope.capacity,
        })
    }
}
