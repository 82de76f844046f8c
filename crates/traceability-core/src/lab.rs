use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::lot::LotId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct LabTestId(pub Ulid);

impl LabTestId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for LabTestId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for LabTestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lab verification of a lot (potency, contaminants, moisture, ...). Consumes nothing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LabTestCommand {
    pub lot_id: LotId,
    pub test_type: String,
    pub lab_name: String,
    #[serde(default)]
    pub certificate_number: Option<String>,
    pub passed: bool,
    #[serde(default)]
    pub results: BTreeMap<String, String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub occurred_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LabTestRecord {
    pub test_id: LabTestId,
    pub lot_id: LotId,
    pub test_type: String,
    pub lab_name: String,
    pub certificate_number: Option<String>,
    pub passed: bool,
    #[serde(default)]
    pub results: BTreeMap<String, String>,
    pub notes: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub tested_at: OffsetDateTime,
}

impl LabTestRecord {
    #[must_use]
    pub fn verdict(&self) -> &'static str {
        if self.passed {
            "passed"
        } else {
            "failed"
        }
    }
}
