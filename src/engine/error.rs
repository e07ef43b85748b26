use chrono::NaiveDateTime;
use ulid::Ulid;

use crate::hours::WindowKind;
use crate::model::LoanStatus;

#[derive(Debug)]
pub enum EngineError {
    NotFound(&'static str, Ulid),
    InvalidLoanState {
        loan_id: Ulid,
        status: LoanStatus,
        operation: &'static str,
    },
    InsufficientAvailability {
        model_id: Ulid,
        requested: u32,
        available: u32,
    },
    InsufficientStock {
        model_id: Ulid,
        requested: u32,
        available: u32,
    },
    AssetMismatch {
        item_id: Ulid,
        asset_id: Option<Ulid>,
        reason: &'static str,
    },
    MissingRequiredField(Ulid),
    ClosedForRange {
        location_id: Ulid,
        at: NaiveDateTime,
        kind: WindowKind,
    },
    Validation(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Stable kind name for callers translating errors into responses.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound(..) => "not_found",
            EngineError::InvalidLoanState { .. } => "invalid_loan_state",
            EngineError::InsufficientAvailability { .. } => "insufficient_availability",
            EngineError::InsufficientStock { .. } => "insufficient_stock",
            EngineError::AssetMismatch { .. } => "asset_mismatch",
            EngineError::MissingRequiredField(_) => "missing_required_field",
            EngineError::ClosedForRange { .. } => "closed_for_range",
            EngineError::Validation(_) => "validation_error",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(what, id) => write!(f, "{what} not found: {id}"),
            EngineError::InvalidLoanState {
                loan_id,
                status,
                operation,
            } => write!(f, "cannot {operation} loan {loan_id} while it is {status}"),
            EngineError::InsufficientAvailability {
                model_id,
                requested,
                available,
            } => write!(
                f,
                "model {model_id}: requested {requested} units, only {available} available"
            ),
            EngineError::InsufficientStock {
                model_id,
                requested,
                available,
            } => write!(
                f,
                "model {model_id}: requested {requested} from stock, only {available} on hand"
            ),
            EngineError::AssetMismatch {
                item_id,
                asset_id,
                reason,
            } => match asset_id {
                Some(asset) => write!(f, "asset {asset} cannot be bound to item {item_id}: {reason}"),
                None => write!(f, "item {item_id}: {reason}"),
            },
            EngineError::MissingRequiredField(asset_id) => {
                write!(f, "asset {asset_id} is missing a required custom field")
            }
            EngineError::ClosedForRange { location_id, at, kind } => write!(
                f,
                "location {location_id} is closed for {} at {at}",
                kind.as_str()
            ),
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
