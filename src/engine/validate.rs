use ulid::Ulid;

use crate::limits::*;
use crate::model::{Ms, Span};

use super::EngineError;

pub(crate) fn validate_id(id: Ulid) -> Result<(), EngineError> {
    if id.is_nil() {
        return Err(EngineError::InvalidInput("id must not be nil".into()));
    }
    Ok(())
}

pub(crate) fn validate_identity(field: &str, value: &str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::InvalidInput(format!("{field} must not be blank")));
    }
    if value.len() > MAX_IDENTITY_LEN {
        return Err(EngineError::InvalidInput(format!(
            "{field} longer than {MAX_IDENTITY_LEN} bytes"
        )));
    }
    Ok(())
}

pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::InvalidInput(format!(
            "window start {start} must be before end {end}"
        )));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    let span = Span::new(start, end);
    if span.duration_ms() > MAX_WINDOW_DURATION_MS {
        return Err(EngineError::LimitExceeded("window too long"));
    }
    Ok(span)
}
