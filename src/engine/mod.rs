//! Reservation engine: the only writer of the held flag outside the
//! reconciler, and the owner of the hold → book → compensate sequence that
//! spans the two stores.

mod error;
mod mutations;
mod queries;
mod validate;

pub use error::EngineError;

use std::sync::Arc;

use crate::notify::NotifyHub;
use crate::store::{BookingStore, WindowStore};

/// Cheap to clone; every clone shares the same stores and hub.
#[derive(Clone)]
pub struct ReservationEngine {
    windows: Arc<dyn WindowStore>,
    bookings: Arc<dyn BookingStore>,
    notify: Arc<NotifyHub>,
}

impl ReservationEngine {
    pub fn new(
        windows: Arc<dyn WindowStore>,
        bookings: Arc<dyn BookingStore>,
        notify: Arc<NotifyHub>,
    ) -> Self {
        Self {
            windows,
            bookings,
            notify,
        }
    }

    pub fn notify(&self) -> &Arc<NotifyHub> {
        &self.notify
    }
}
