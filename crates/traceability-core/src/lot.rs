use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::TraceError;

/// Consumption requests may exceed availability by at most this much before being rejected,
/// and remainders below it are snapped to zero.
pub const QUANTITY_EPSILON: f64 = 1e-9;

/// Opaque provenance/compliance payload carried by a lot (vendor, invoice, profile, ...).
pub type Attributes = BTreeMap<String, String>;

/// Business lot number. Immutable once a lot is created.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct LotId(String);

impl LotId {
    /// Parse a caller-supplied lot number, trimming surrounding whitespace.
    ///
    /// # Errors
    /// Returns [`TraceError::InvalidCommand`] when the id is blank.
    pub fn parse(raw: &str) -> Result<Self, TraceError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(TraceError::InvalidCommand("lot id MUST be non-empty".to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for LotId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl Display for LotId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unit of measure, normalized to trimmed lower-case.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct Unit(String);

impl Unit {
    /// # Errors
    /// Returns [`TraceError::InvalidUnit`] when the unit is blank.
    pub fn parse(raw: &str) -> Result<Self, TraceError> {
        let normalized = raw.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(TraceError::InvalidUnit { unit: raw.to_string() });
        }
        Ok(Self(normalized))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Unit {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Classification tag such as "Plant Material" or "Concentrates".
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct Category(String);

impl Category {
    /// # Errors
    /// Returns [`TraceError::InvalidCategory`] when the category is blank.
    pub fn parse(raw: &str) -> Result<Self, TraceError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(TraceError::InvalidCategory { category: raw.to_string() });
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Category {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LotStatus {
    Active,
    Depleted,
}

impl LotStatus {
    #[must_use]
    pub fn for_quantity(quantity: f64) -> Self {
        if quantity <= 0.0 {
            Self::Depleted
        } else {
            Self::Active
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Depleted => "depleted",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "depleted" => Some(Self::Depleted),
            _ => None,
        }
    }
}

/// How a lot came into existence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LotOrigin {
    Intake,
    Subdivided,
    Processed,
}

impl LotOrigin {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Intake => "intake",
            Self::Subdivided => "subdivided",
            Self::Processed => "processed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "intake" => Some(Self::Intake),
            "subdivided" => Some(Self::Subdivided),
            "processed" => Some(Self::Processed),
            _ => None,
        }
    }
}

/// One source lot and the amount drawn from it, in the source lot's unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LotInput {
    pub lot_id: LotId,
    pub quantity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lot {
    pub id: LotId,
    pub quantity: f64,
    pub original_quantity: f64,
    pub unit: Unit,
    pub category: Category,
    pub product_type: Option<String>,
    pub status: LotStatus,
    pub origin: LotOrigin,
    pub parent_lot_id: Option<LotId>,
    #[serde(default)]
    pub inputs: Vec<LotInput>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default)]
    pub attributes: Attributes,
}

impl Lot {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == LotStatus::Active
    }

    /// Amount drawn from this lot since creation.
    #[must_use]
    pub fn consumed(&self) -> f64 {
        self.original_quantity - self.quantity
    }
}

/// Everything needed to create a lot; the ledger derives status and original quantity.
#[derive(Debug, Clone, PartialEq)]
pub struct NewLot {
    pub id: LotId,
    pub quantity: f64,
    pub unit: Unit,
    pub category: Category,
    pub product_type: Option<String>,
    pub origin: LotOrigin,
    pub parent_lot_id: Option<LotId>,
    pub inputs: Vec<LotInput>,
    pub created_at: OffsetDateTime,
    pub attributes: Attributes,
}

impl NewLot {
    pub(crate) fn into_lot(self) -> Lot {
        Lot {
            status: LotStatus::for_quantity(self.quantity),
            original_quantity: self.quantity,
            id: self.id,
            quantity: self.quantity,
            unit: self.unit,
            category: self.category,
            product_type: self.product_type,
            origin: self.origin,
            parent_lot_id: self.parent_lot_id,
            inputs: self.inputs,
            created_at: self.created_at,
            attributes: self.attributes,
        }
    }
}

/// Reject non-finite and non-positive amounts.
///
/// # Errors
/// Returns [`TraceError::InvalidQuantity`] naming `field`.
pub fn require_positive(field: &str, value: f64) -> Result<f64, TraceError> {
    if !value.is_finite() {
        return Err(TraceError::invalid_quantity(format!("{field} MUST be a finite number")));
    }
    if value <= 0.0 {
        return Err(TraceError::invalid_quantity(format!("{field} MUST be > 0, got {value}")));
    }
    Ok(value)
}

/// `true` when `requested` fits in `available` within [`QUANTITY_EPSILON`].
#[must_use]
pub fn fits(requested: f64, available: f64) -> bool {
    requested <= available + QUANTITY_EPSILON
}

pub(crate) fn settle(remaining: f64) -> f64 {
    if remaining < QUANTITY_EPSILON {
        0.0
    } else {
        remaining
    }
}
