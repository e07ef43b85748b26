use chrono::NaiveDateTime;
use ulid::Ulid;

use crate::hours::{OpeningWindowOracle, WindowKind};
use crate::limits::MAX_LOAN_DAYS;
use crate::model::Period;

use super::EngineError;

/// A loan period must end after it starts and stay within the loan span limit.
pub fn validate_period(period: &Period) -> Result<(), EngineError> {
    if period.end <= period.start {
        return Err(EngineError::Validation("period must end after it starts".into()));
    }
    if period.days() > MAX_LOAN_DAYS {
        return Err(EngineError::LimitExceeded("loan period too long"));
    }
    Ok(())
}

/// The location must have a window of `kind` containing `at`.
pub(crate) async fn require_open(
    hours: &dyn OpeningWindowOracle,
    location_id: Ulid,
    at: NaiveDateTime,
    kind: WindowKind,
) -> Result<(), EngineError> {
    let windows = hours.windows_for(location_id, at.date(), kind).await;
    if windows.iter().any(|w| w.contains(at.time())) {
        Ok(())
    } else {
        Err(EngineError::ClosedForRange { location_id, at, kind })
    }
}

/// Pickup must be possible at the start and return at the end.
pub async fn require_open_for(
    hours: &dyn OpeningWindowOracle,
    location_id: Ulid,
    period: &Period,
) -> Result<(), EngineError> {
    require_open(hours, location_id, period.start, WindowKind::Pickup).await?;
    require_open(hours, location_id, period.end, WindowKind::Return).await
}
