use crate::model::*;

use super::validate::validate_identity;
use super::{EngineError, ReservationEngine};

impl ReservationEngine {
    /// Open windows of one tutor, sorted by start.
    pub async fn open_windows(&self, owner_id: &str) -> Result<Vec<AvailabilityWindow>, EngineError> {
        validate_identity("owner_id", owner_id)?;
        Ok(self.windows.list_open(owner_id).await?)
    }

    /// Windows (open or held) lying entirely inside `[from, to]`.
    pub async fn windows_in_range(
        &self,
        owner_id: &str,
        from: Ms,
        to: Ms,
    ) -> Result<Vec<AvailabilityWindow>, EngineError> {
        validate_identity("owner_id", owner_id)?;
        if from > to {
            return Err(EngineError::InvalidInput(format!(
                "range start {from} is after range end {to}"
            )));
        }
        Ok(self.windows.list_in_range(owner_id, from, to).await?)
    }

    pub async fn bookings_for_student(&self, student_id: &str) -> Result<Vec<Booking>, EngineError> {
        validate_identity("student_id", student_id)?;
        Ok(self.bookings.list_by_student(student_id).await?)
    }

    pub async fn bookings_for_tutor(&self, tutor_id: &str) -> Result<Vec<Booking>, EngineError> {
        validate_identity("tutor_id", tutor_id)?;
        Ok(self.bookings.list_by_tutor(tutor_id).await?)
    }
}
