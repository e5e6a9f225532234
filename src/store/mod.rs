//! Durable storage for availability windows and bookings.
//!
//! The two stores are independent: each has its own log and its
//! own locks, so nothing spanning both of them can be assumed atomic. The
//! engine coordinates them with a hold → insert → compensate sequence.

mod bookings;
mod windows;

pub use bookings::WalBookingStore;
pub use windows::WalWindowStore;

use async_trait::async_trait;
use thiserror::Error;
use ulid::Ulid;

use crate::model::{AvailabilityWindow, Booking, Ms};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("window {0} is held and cannot be replaced or removed")]
    WindowHeld(Ulid),
    #[error("window {0} belongs to another owner")]
    OwnerChanged(Ulid),
    #[error("duplicate booking id: {0}")]
    DuplicateId(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Outcome of the conditional `held = false → true` update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkHeld {
    /// This caller flipped the flag. Carries the window as it is now.
    Held(AvailabilityWindow),
    AlreadyHeld,
    NotFound,
}

/// Outcome of the conditional `held = true → false` update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    Released,
    NotHeld,
    NotFound,
}

/// Outcome of removing an open window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removal {
    Removed(AvailabilityWindow),
    Held,
    NotFound,
}

/// Interval Store contract.
///
/// `mark_held` and `release` must be single conditional writes against the
/// backing storage (compare-and-set on the held flag), never a read followed
/// by a write, so callers racing on one id can't both win.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Insert or replace by id. Replacing a held window fails with `WindowHeld`.
    async fn put(&self, window: AvailabilityWindow) -> Result<(), StoreError>;

    async fn get(&self, id: Ulid) -> Result<Option<AvailabilityWindow>, StoreError>;

    async fn list_open(&self, owner_id: &str) -> Result<Vec<AvailabilityWindow>, StoreError>;

    /// Windows with `start >= from` and `end <= to`.
    async fn list_in_range(
        &self,
        owner_id: &str,
        from: Ms,
        to: Ms,
    ) -> Result<Vec<AvailabilityWindow>, StoreError>;

    async fn mark_held(&self, id: Ulid, at: Ms) -> Result<MarkHeld, StoreError>;

    async fn release(&self, id: Ulid) -> Result<Release, StoreError>;

    async fn remove(&self, id: Ulid) -> Result<Removal, StoreError>;

    /// Held windows whose `held_at` is at or before `cutoff`, across all owners.
    async fn list_held_before(&self, cutoff: Ms) -> Result<Vec<AvailabilityWindow>, StoreError>;
}

/// Booking Store contract.
#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn insert(&self, booking: Booking) -> Result<(), StoreError>;

    async fn list_by_student(&self, student_id: &str) -> Result<Vec<Booking>, StoreError>;

    async fn list_by_tutor(&self, tutor_id: &str) -> Result<Vec<Booking>, StoreError>;

    async fn get_by_window(&self, window_id: Ulid) -> Result<Option<Booking>, StoreError>;
}
