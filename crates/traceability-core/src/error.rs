use crate::lot::LotId;

/// Every way a ledger command or query can be refused.
///
/// Validation variants are raised before any state is touched, so a caller that receives
/// one can correct its input and resubmit against an unchanged ledger.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum TraceError {
    #[error("lot id already exists: {lot_id}")]
    DuplicateId { lot_id: LotId },
    #[error("lot not found: {lot_id}")]
    LotNotFound { lot_id: LotId },
    #[error("unknown parent lot: {lot_id}")]
    UnknownParent { lot_id: LotId },
    #[error("unknown input lot: {lot_id}")]
    UnknownInput { lot_id: LotId },
    #[error("insufficient quantity in lot {lot_id}: requested {requested}, available {available}")]
    InsufficientQuantity { lot_id: LotId, requested: f64, available: f64 },
    #[error(
        "over-allocation of parent lot {parent_lot_id}: requested {requested}, available {available}"
    )]
    OverAllocation { parent_lot_id: LotId, requested: f64, available: f64 },
    #[error("invalid quantity: {reason}")]
    InvalidQuantity { reason: String },
    #[error("invalid unit: {unit:?}")]
    InvalidUnit { unit: String },
    #[error("invalid category: {category:?}")]
    InvalidCategory { category: String },
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl TraceError {
    /// Stable machine-readable name of the error kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DuplicateId { .. } => "duplicate_id",
            Self::LotNotFound { .. } => "lot_not_found",
            Self::UnknownParent { .. } => "unknown_parent",
            Self::UnknownInput { .. } => "unknown_input",
            Self::InsufficientQuantity { .. } => "insufficient_quantity",
            Self::OverAllocation { .. } => "over_allocation",
            Self::InvalidQuantity { .. } => "invalid_quantity",
            Self::InvalidUnit { .. } => "invalid_unit",
            Self::InvalidCategory { .. } => "invalid_category",
            Self::InvalidCommand(_) => "invalid_command",
            Self::CorruptSnapshot(_) => "corrupt_snapshot",
            Self::Storage(_) => "storage",
        }
    }

    /// How much a rejected allocation exceeded what was available.
    #[must_use]
    pub fn shortfall(&self) -> Option<f64> {
        match self {
            Self::InsufficientQuantity { requested, available, .. }
            | Self::OverAllocation { requested, available, .. } => Some(requested - available),
            _ => None,
        }
    }

    pub(crate) fn invalid_quantity(reason: impl Into<String>) -> Self {
        Self::InvalidQuantity { reason: reason.into() }
    }
}
