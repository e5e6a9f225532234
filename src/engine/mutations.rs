use std::time::{Duration, Instant};

use ulid::Ulid;

use crate::model::*;
use crate::observability::{
    CLAIMS_TOTAL, CLAIM_DURATION_SECONDS, COMPENSATIONS_TOTAL, ORPHANS_RELEASED_TOTAL,
    WINDOWS_PUBLISHED_TOTAL,
};
use crate::store::{MarkHeld, Release, Removal, StoreError};

use super::validate::{validate_id, validate_identity, validate_span};
use super::{EngineError, ReservationEngine};

impl ReservationEngine {
    /// Book `window_id` for `student_id`.
    ///
    /// The work runs on its own task: once storage has been touched the
    /// claim finishes (booked, or compensated) even if the caller stops
    /// waiting.
    pub async fn claim(&self, window_id: Ulid, student_id: &str) -> Result<Booking, EngineError> {
        validate_id(window_id)?;
        validate_identity("student_id", student_id)?;

        let engine = self.clone();
        let student_id = student_id.to_string();
        let task = tokio::spawn(async move {
            let started = Instant::now();
            let result = engine.run_claim(window_id, student_id).await;
            let outcome = match &result {
                Ok(_) => "booked",
                Err(e) => e.kind(),
            };
            metrics::counter!(CLAIMS_TOTAL, "outcome" => outcome).increment(1);
            metrics::histogram!(CLAIM_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
            result
        });

        match task.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(%window_id, error = %e, "claim task aborted");
                Err(EngineError::Storage(StoreError::Unavailable(format!(
                    "claim task aborted: {e}"
                ))))
            }
        }
    }

    async fn run_claim(&self, window_id: Ulid, student_id: String) -> Result<Booking, EngineError> {
        let now = now_ms();
        let window = match self.windows.mark_held(window_id, now).await? {
            MarkHeld::Held(window) => window,
            MarkHeld::AlreadyHeld => return Err(EngineError::AlreadyBooked(window_id)),
            MarkHeld::NotFound => return Err(EngineError::NotFound(window_id)),
        };
        self.notify.send(&WindowEvent::Held {
            id: window_id,
            owner_id: window.owner_id.clone(),
            at: now,
        });

        let booking = Booking {
            id: Ulid::new(),
            window_id,
            student_id,
            tutor_id: window.owner_id.clone(),
            span: window.span,
            booked_at: now,
        };
        match self.bookings.insert(booking.clone()).await {
            Ok(()) => {
                tracing::info!(
                    booking_id = %booking.id,
                    %window_id,
                    student_id = %booking.student_id,
                    tutor_id = %booking.tutor_id,
                    "window booked"
                );
                Ok(booking)
            }
            Err(source) => Err(self.compensate(&window, source).await),
        }
    }

    /// Undo the hold after the booking write failed. Runs exactly once.
    async fn compensate(&self, window: &AvailabilityWindow, source: StoreError) -> EngineError {
        tracing::warn!(window_id = %window.id, error = %source, "booking insert failed, releasing hold");
        let rolled_back = match self.windows.release(window.id).await {
            Ok(Release::Released) => {
                metrics::counter!(COMPENSATIONS_TOTAL, "result" => "released").increment(1);
                self.notify.send(&WindowEvent::Released {
                    id: window.id,
                    owner_id: window.owner_id.clone(),
                });
                true
            }
            // Someone else already reopened it; the window is open either way.
            Ok(Release::NotHeld) => {
                metrics::counter!(COMPENSATIONS_TOTAL, "result" => "not_held").increment(1);
                true
            }
            Ok(Release::NotFound) => {
                tracing::error!(window_id = %window.id, "held window vanished during compensation");
                metrics::counter!(COMPENSATIONS_TOTAL, "result" => "not_found").increment(1);
                true
            }
            Err(e) => {
                tracing::error!(
                    window_id = %window.id,
                    owner_id = %window.owner_id,
                    error = %e,
                    "compensating release failed; window stays held, reconciliation required"
                );
                metrics::counter!(COMPENSATIONS_TOTAL, "result" => "failed").increment(1);
                false
            }
        };
        EngineError::PersistenceFailure {
            window_id: window.id,
            rolled_back,
            source,
        }
    }

    /// Create or replace an open window.
    pub async fn publish_window(
        &self,
        id: Ulid,
        owner_id: &str,
        start: Ms,
        end: Ms,
    ) -> Result<AvailabilityWindow, EngineError> {
        validate_id(id)?;
        validate_identity("owner_id", owner_id)?;
        let span = validate_span(start, end)?;

        let window = AvailabilityWindow::open(id, owner_id, span);
        self.windows.put(window.clone()).await.map_err(|e| match e {
            StoreError::WindowHeld(id) => EngineError::AlreadyBooked(id),
            StoreError::OwnerChanged(id) => {
                EngineError::InvalidInput(format!("window {id} belongs to another owner"))
            }
            StoreError::LimitExceeded(what) => EngineError::LimitExceeded(what),
            other => EngineError::Storage(other),
        })?;

        metrics::counter!(WINDOWS_PUBLISHED_TOTAL).increment(1);
        self.notify.send(&WindowEvent::Put {
            window: window.clone(),
        });
        Ok(window)
    }

    /// Remove an open window. Held windows are never removed.
    pub async fn withdraw_window(&self, id: Ulid) -> Result<AvailabilityWindow, EngineError> {
        validate_id(id)?;
        match self.windows.remove(id).await? {
            Removal::Removed(window) => {
                self.notify.send(&WindowEvent::Removed {
                    id,
                    owner_id: window.owner_id.clone(),
                });
                Ok(window)
            }
            Removal::Held => Err(EngineError::AlreadyBooked(id)),
            Removal::NotFound => Err(EngineError::NotFound(id)),
        }
    }

    /// Release windows held since before `now - grace` that never got a
    /// booking. Returns how many were released.
    ///
    /// `grace` must exceed the storage write timeout, otherwise a claim still
    /// waiting on its booking insert could be swept.
    pub async fn reconcile(&self, now: Ms, grace: Duration) -> Result<usize, EngineError> {
        let grace_ms = Ms::try_from(grace.as_millis()).unwrap_or(Ms::MAX);
        let cutoff = now.saturating_sub(grace_ms);
        let mut released = 0;

        for window in self.windows.list_held_before(cutoff).await? {
            match self.bookings.get_by_window(window.id).await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(window_id = %window.id, error = %e, "booking lookup failed, skipping");
                    continue;
                }
            }
            match self.windows.release(window.id).await {
                Ok(Release::Released) => {
                    tracing::warn!(
                        window_id = %window.id,
                        owner_id = %window.owner_id,
                        held_at = ?window.held_at,
                        "released orphaned hold"
                    );
                    metrics::counter!(ORPHANS_RELEASED_TOTAL).increment(1);
                    self.notify.send(&WindowEvent::Released {
                        id: window.id,
                        owner_id: window.owner_id.clone(),
                    });
                    released += 1;
                }
                Ok(Release::NotHeld | Release::NotFound) => {}
                Err(e) => {
                    tracing::warn!(window_id = %window.id, error = %e, "orphan release failed");
                }
            }
        }
        Ok(released)
    }
}
