use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio_test::{assert_err, assert_ok};
use ulid::Ulid;

use super::*;
use crate::model::{PaymentMethod, PerformanceType, ScopeKind, Span};

const T: i64 = 1_761_847_200_000;

/// Minimal uniqueness-enforcing store.
#[derive(Default)]
struct MemoryStore {
    slots: Mutex<BTreeMap<u32, Booking>>,
    queries: AtomicU32,
}

impl MemoryStore {
    fn with_slots(taken: &[u32]) -> Self {
        let store = Self::default();
        {
            let mut slots = store.slots.lock().unwrap();
            for &slot in taken {
                slots.insert(slot, stub_booking(slot));
            }
        }
        store
    }

    fn taken(&self) -> Vec<u32> {
        self.slots.lock().unwrap().keys().copied().collect()
    }
}

fn stub_booking(slot: u32) -> Booking {
    Booking {
        id: Ulid::new(),
        scope_id: Ulid::nil(),
        slot_number: slot,
        approximate_time: None,
        details: details("seed"),
        created_at: 0,
    }
}

#[async_trait]
impl SlotStore for MemoryStore {
    async fn occupied_slots(&self, _scope_id: Ulid) -> Result<Vec<u32>, StoreError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.taken())
    }

    async fn insert_booking(&self, new: NewBooking) -> Result<Booking, InsertError> {
        let mut slots = self.slots.lock().unwrap();
        if slots.contains_key(&new.slot_number) {
            return Err(InsertError::Duplicate {
                scope_id: new.scope_id,
                slot_number: new.slot_number,
            });
        }
        let booking = Booking {
            id: Ulid::new(),
            scope_id: new.scope_id,
            slot_number: new.slot_number,
            approximate_time: new.approximate_time,
            details: new.details,
            created_at: T,
        };
        slots.insert(new.slot_number, booking.clone());
        Ok(booking)
    }
}

/// Lets a competing request claim the candidate just before our first insert.
struct RacingStore {
    inner: MemoryStore,
    races_left: AtomicU32,
}

#[async_trait]
impl SlotStore for RacingStore {
    async fn occupied_slots(&self, scope_id: Ulid) -> Result<Vec<u32>, StoreError> {
        self.inner.occupied_slots(scope_id).await
    }

    async fn insert_booking(&self, new: NewBooking) -> Result<Booking, InsertError> {
        if self.races_left.load(Ordering::SeqCst) > 0 {
            self.races_left.fetch_sub(1, Ordering::SeqCst);
            let mut rival = new.clone();
            rival.details.performer_name = "rival".into();
            self.inner.insert_booking(rival).await?;
        }
        self.inner.insert_booking(new).await
    }
}

/// Rejects every insert as a duplicate.
#[derive(Default)]
struct AlwaysConflicting {
    inserts: AtomicU32,
}

#[async_trait]
impl SlotStore for AlwaysConflicting {
    async fn occupied_slots(&self, _scope_id: Ulid) -> Result<Vec<u32>, StoreError> {
        Ok(Vec::new())
    }

    async fn insert_booking(&self, new: NewBooking) -> Result<Booking, InsertError> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        Err(InsertError::Duplicate {
            scope_id: new.scope_id,
            slot_number: new.slot_number,
        })
    }
}

/// Fails every insert with a non-retryable error.
#[derive(Default)]
struct BrokenStore {
    inserts: AtomicU32,
}

#[async_trait]
impl SlotStore for BrokenStore {
    async fn occupied_slots(&self, _scope_id: Ulid) -> Result<Vec<u32>, StoreError> {
        Ok(Vec::new())
    }

    async fn insert_booking(&self, _new: NewBooking) -> Result<Booking, InsertError> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Unavailable("disk full".into()).into())
    }
}

/// Reports occupied slots in descending order.
struct UnsortedStore {
    inner: MemoryStore,
}

#[async_trait]
impl SlotStore for UnsortedStore {
    async fn occupied_slots(&self, scope_id: Ulid) -> Result<Vec<u32>, StoreError> {
        let mut slots = self.inner.occupied_slots(scope_id).await?;
        slots.reverse();
        Ok(slots)
    }

    async fn insert_booking(&self, new: NewBooking) -> Result<Booking, InsertError> {
        self.inner.insert_booking(new).await
    }
}

fn details(name: &str) -> BookingDetails {
    BookingDetails::new(name, PerformanceType::Comedy, PaymentMethod::Venmo, "device-abcdef")
}

fn scope(capacity: u32) -> Scope {
    Scope {
        id: Ulid::new(),
        kind: ScopeKind::Block,
        name: None,
        capacity,
        starts_at: T,
        slot_minutes: 4,
        breaks: Vec::new(),
        filled: 0,
    }
}

fn allocator<S: SlotStore>(store: S) -> SlotAllocator<S> {
    SlotAllocator::new(Arc::new(store), AllocatorConfig::default())
}

#[tokio::test]
async fn gap_filling_picks_lowest_hole() {
    let alloc = allocator(MemoryStore::with_slots(&[1, 2, 4]));
    let booking = assert_ok!(alloc.allocate(&scope(5), details("a"), AllocationPolicy::GapFilling).await);
    assert_eq!(booking.slot_number, 3);
    assert_eq!(booking.approximate_time, None);
}

#[tokio::test]
async fn sequential_takes_max_plus_one() {
    let alloc = allocator(MemoryStore::with_slots(&[1, 3, 7]));
    let sc = scope(10);
    let booking = assert_ok!(alloc.allocate(&sc, details("a"), AllocationPolicy::Sequential).await);
    assert_eq!(booking.slot_number, 8);
    assert_eq!(booking.approximate_time, Some(T + 7 * 4 * MINUTE_MS));
}

#[tokio::test]
async fn candidates_do_not_depend_on_store_order() {
    let gap = allocator(UnsortedStore { inner: MemoryStore::with_slots(&[1, 2, 3]) });
    let booking = assert_ok!(gap.allocate(&scope(5), details("a"), AllocationPolicy::GapFilling).await);
    assert_eq!(booking.slot_number, 4);

    let seq = allocator(UnsortedStore { inner: MemoryStore::with_slots(&[1, 2, 3]) });
    let booking = assert_ok!(seq.allocate(&scope(5), details("a"), AllocationPolicy::Sequential).await);
    assert_eq!(booking.slot_number, 4);
    assert_eq!(seq.store().inner.taken(), vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn sequential_projection_skips_breaks() {
    let alloc = allocator(MemoryStore::with_slots(&[1, 2, 3, 4, 5]));
    let mut sc = scope(20);
    sc.breaks = vec![Span::new(T + 20 * MINUTE_MS, T + 30 * MINUTE_MS)];
    let booking = assert_ok!(alloc.allocate(&sc, details("a"), AllocationPolicy::Sequential).await);
    assert_eq!(booking.slot_number, 6);
    assert_eq!(booking.approximate_time, Some(T + 30 * MINUTE_MS));
}

#[tokio::test]
async fn capacity_is_never_exceeded() {
    let alloc = allocator(MemoryStore::default());
    let sc = scope(3);
    for expected in 1..=3 {
        let b = assert_ok!(alloc.allocate(&sc, details("a"), AllocationPolicy::GapFilling).await);
        assert_eq!(b.slot_number, expected);
    }
    let err = assert_err!(alloc.allocate(&sc, details("late"), AllocationPolicy::GapFilling).await);
    assert_eq!(err, AllocationError::ScopeFull { scope_id: sc.id, capacity: 3 });
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn sequential_full_even_with_gaps() {
    let alloc = allocator(MemoryStore::with_slots(&[2, 5]));
    let err = assert_err!(alloc.allocate(&scope(5), details("a"), AllocationPolicy::Sequential).await);
    assert!(matches!(err, AllocationError::ScopeFull { capacity: 5, .. }));
}

#[tokio::test]
async fn lost_race_retries_with_fresh_candidate() {
    let store = RacingStore {
        inner: MemoryStore::with_slots(&[1]),
        races_left: AtomicU32::new(1),
    };
    let alloc = allocator(store);
    let booking = assert_ok!(alloc.allocate(&scope(5), details("me"), AllocationPolicy::GapFilling).await);
    // The rival took 2 first; the retry re-read and landed on 3.
    assert_eq!(booking.slot_number, 3);
    assert_eq!(alloc.store().inner.taken(), vec![1, 2, 3]);
    assert_eq!(alloc.store().inner.queries.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn lost_race_into_full_scope_reports_full() {
    let store = RacingStore {
        inner: MemoryStore::with_slots(&[1]),
        races_left: AtomicU32::new(1),
    };
    let alloc = allocator(store);
    let err = assert_err!(alloc.allocate(&scope(2), details("me"), AllocationPolicy::GapFilling).await);
    assert!(matches!(err, AllocationError::ScopeFull { .. }));
}

#[tokio::test]
async fn exhausted_budget_is_contention() {
    let alloc = allocator(AlwaysConflicting::default());
    let sc = scope(5);
    let err = assert_err!(alloc.allocate(&sc, details("a"), AllocationPolicy::GapFilling).await);
    assert_eq!(err, AllocationError::Contention { scope_id: sc.id, attempts: 5 });
    assert!(err.is_retryable());
    assert_eq!(alloc.store().inserts.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn custom_budget_is_respected() {
    let config = AllocatorConfig { retry_budget: 2, timeout: None };
    let alloc = SlotAllocator::new(Arc::new(AlwaysConflicting::default()), config);
    let err = assert_err!(alloc.allocate(&scope(5), details("a"), AllocationPolicy::Sequential).await);
    assert!(matches!(err, AllocationError::Contention { attempts: 2, .. }));
    assert_eq!(alloc.store().inserts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn zero_budget_still_makes_one_attempt() {
    let config = AllocatorConfig { retry_budget: 0, timeout: None };
    let alloc = SlotAllocator::new(Arc::new(MemoryStore::default()), config);
    let booking = assert_ok!(alloc.allocate(&scope(1), details("a"), AllocationPolicy::GapFilling).await);
    assert_eq!(booking.slot_number, 1);
}

#[tokio::test]
async fn storage_failure_is_not_retried() {
    let alloc = allocator(BrokenStore::default());
    let err = assert_err!(alloc.allocate(&scope(5), details("a"), AllocationPolicy::GapFilling).await);
    assert_eq!(err, AllocationError::Storage(StoreError::Unavailable("disk full".into())));
    assert_eq!(alloc.store().inserts.load(Ordering::SeqCst), 1);
    assert_eq!(err.user_message(), "Something went wrong, please try again in a moment.");
}

#[tokio::test]
async fn deadline_stops_between_attempts() {
    let config = AllocatorConfig {
        retry_budget: 5,
        timeout: Some(Duration::ZERO),
    };
    let alloc = SlotAllocator::new(Arc::new(AlwaysConflicting::default()), config);
    let err = assert_err!(alloc.allocate(&scope(5), details("a"), AllocationPolicy::GapFilling).await);
    assert_eq!(err, AllocationError::Storage(StoreError::DeadlineExceeded));
    // The first attempt always runs; the deadline is only checked between attempts.
    assert_eq!(alloc.store().inserts.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_get_distinct_slots() {
    let alloc = SlotAllocator::new(
        Arc::new(MemoryStore::default()),
        AllocatorConfig { retry_budget: 50, timeout: None },
    );
    let sc = scope(8);
    let mut handles = Vec::new();
    for i in 0..12 {
        let alloc = alloc.clone();
        let sc = sc.clone();
        handles.push(tokio::spawn(async move {
            alloc.allocate(&sc, details(&format!("p{i}")), AllocationPolicy::GapFilling).await
        }));
    }

    let mut slots = Vec::new();
    for h in handles {
        match h.await.unwrap() {
            Ok(b) => slots.push(b.slot_number),
            Err(AllocationError::ScopeFull { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    let unique: HashSet<u32> = slots.iter().copied().collect();
    assert_eq!(unique.len(), slots.len());
    assert_eq!(slots.len(), 8);
    assert!(slots.iter().all(|&s| (1..=8).contains(&s)));
}

#[test]
fn error_messages() {
    let id = Ulid::nil();
    assert_eq!(
        AllocationError::ScopeFull { scope_id: id, capacity: 4 }.to_string(),
        format!("scope {id} is full (capacity 4)")
    );
    assert_eq!(
        AllocationError::Storage(StoreError::DeadlineExceeded).to_string(),
        "storage error: allocation deadline exceeded"
    );
    assert!(!AllocationError::Storage(StoreError::Rejected("bad".into())).is_retryable());
}
