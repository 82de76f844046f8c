use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::lot::{Attributes, LotId, LotInput};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ProcessId(pub Ulid);

impl ProcessId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ProcessId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ProcessId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Intake,
    Subdivide,
    Snowcap,
    Blend,
    Convert,
    Ship,
}

impl ProcessKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Intake => "intake",
            Self::Subdivide => "subdivide",
            Self::Snowcap => "snowcap",
            Self::Blend => "blend",
            Self::Convert => "convert",
            Self::Ship => "ship",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "intake" => Some(Self::Intake),
            "subdivide" => Some(Self::Subdivide),
            "snowcap" => Some(Self::Snowcap),
            "blend" => Some(Self::Blend),
            "convert" => Some(Self::Convert),
            "ship" => Some(Self::Ship),
            _ => None,
        }
    }

    /// Kinds whose consumption leaves the subdivision tree as a new, transformed lot.
    #[must_use]
    pub fn is_transform(self) -> bool {
        matches!(self, Self::Snowcap | Self::Blend | Self::Convert)
    }
}

/// The N-inputs-to-one-output transformations. They differ only in business meaning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    Snowcap,
    Blend,
    Convert,
}

impl TransformKind {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "snowcap" => Some(Self::Snowcap),
            "blend" => Some(Self::Blend),
            "convert" => Some(Self::Convert),
            _ => None,
        }
    }
}

impl From<TransformKind> for ProcessKind {
    fn from(value: TransformKind) -> Self {
        match value {
            TransformKind::Snowcap => Self::Snowcap,
            TransformKind::Blend => Self::Blend,
            TransformKind::Convert => Self::Convert,
        }
    }
}

/// Delivery details kept on a ship record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Shipment {
    pub recipient: String,
    pub address: Option<String>,
    pub carrier: Option<String>,
    pub tracking_number: Option<String>,
}

/// Immutable log of one transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessRecord {
    pub process_id: ProcessId,
    pub kind: ProcessKind,
    pub inputs: Vec<LotInput>,
    pub outputs: Vec<LotId>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub notes: Option<String>,
    #[serde(default)]
    pub shipment: Option<Shipment>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct IntakeCommand {
    pub lot_id: LotId,
    pub quantity: f64,
    pub unit: String,
    pub category: String,
    #[serde(default)]
    pub product_type: Option<String>,
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub occurred_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ChildSpec {
    pub lot_id: LotId,
    pub quantity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SubdivideCommand {
    pub parent_lot_id: LotId,
    pub children: Vec<ChildSpec>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub occurred_at: Option<OffsetDateTime>,
}

/// The lot a transformation produces. Its quantity is business-supplied, never derived.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct OutputSpec {
    pub lot_id: LotId,
    pub quantity: f64,
    pub unit: String,
    pub category: String,
    #[serde(default)]
    pub product_type: Option<String>,
    #[serde(default)]
    pub attributes: Attributes,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProcessCommand {
    pub kind: TransformKind,
    pub inputs: Vec<LotInput>,
    pub output: OutputSpec,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub occurred_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ShipCommand {
    pub lot_id: LotId,
    pub quantity: f64,
    pub recipient: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub carrier: Option<String>,
    #[serde(default)]
    pub tracking_number: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub occurred_at: Option<OffsetDateTime>,
}

/// What a committed command did.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Receipt {
    pub process_id: ProcessId,
    pub kind: ProcessKind,
    pub created: Vec<LotId>,
    pub consumed: Vec<LotInput>,
}

impl Receipt {
    pub(crate) fn for_record(record: &ProcessRecord) -> Self {
        Self {
            process_id: record.process_id,
            kind: record.kind,
            created: record.outputs.clone(),
            consumed: record.inputs.clone(),
        }
    }
}
