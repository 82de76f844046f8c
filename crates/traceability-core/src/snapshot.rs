use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::custody::CustodyEntry;
use crate::engine::consumption_by_lot;
use crate::error::TraceError;
use crate::lab::LabTestRecord;
use crate::lot::{Lot, LotId, LotOrigin, LotStatus, QUANTITY_EPSILON};
use crate::process::{ProcessId, ProcessKind, ProcessRecord};

pub const SNAPSHOT_FORMAT: &str = "traceability.snapshot.v1";

/// Reconciliation tolerance, relative to a lot's original quantity.
pub const RECONCILE_TOLERANCE: f64 = 1e-6;

/// Full copy of ledger state, as exported and imported.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub format: String,
    pub lots: Vec<Lot>,
    pub processes: Vec<ProcessRecord>,
    pub custody: Vec<CustodyEntry>,
    #[serde(default)]
    pub lab_tests: Vec<LabTestRecord>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            format: SNAPSHOT_FORMAT.to_string(),
            lots: Vec::new(),
            processes: Vec::new(),
            custody: Vec::new(),
            lab_tests: Vec::new(),
        }
    }
}

fn corrupt(message: String) -> TraceError {
    TraceError::CorruptSnapshot(message)
}

pub(crate) fn reconciles(original: f64, accounted: f64) -> bool {
    (original - accounted).abs() <= RECONCILE_TOLERANCE * original.abs().max(1.0)
}

impl Snapshot {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lots.is_empty()
            && self.processes.is_empty()
            && self.custody.is_empty()
            && self.lab_tests.is_empty()
    }

    /// Check every ledger invariant over the whole snapshot.
    ///
    /// Lots must appear in creation order: a lot may only reference lots listed before it.
    ///
    /// # Errors
    /// Returns [`TraceError::CorruptSnapshot`] describing the first violation found.
    pub fn verify(&self) -> Result<(), TraceError> {
        if self.format != SNAPSHOT_FORMAT {
            return Err(corrupt(format!("unsupported snapshot format {:?}", self.format)));
        }
        let lots = self.verify_lots()?;
        let processes = self.verify_processes(&lots)?;
        self.verify_custody(&lots, &processes)?;
        for test in &self.lab_tests {
            if !lots.contains(&test.lot_id) {
                return Err(corrupt(format!(
                    "lab test {} references unknown lot {}",
                    test.test_id, test.lot_id
                )));
            }
        }
        self.verify_reconciliation()
    }

    fn verify_lots(&self) -> Result<BTreeSet<&LotId>, TraceError> {
        let mut seen = BTreeSet::new();
        for lot in &self.lots {
            if !lot.quantity.is_finite() || !lot.original_quantity.is_finite() {
                return Err(corrupt(format!("lot {} has a non-finite quantity", lot.id)));
            }
            if lot.quantity < 0.0 {
                return Err(corrupt(format!("lot {} has negative quantity {}", lot.id, lot.quantity)));
            }
            if lot.quantity > lot.original_quantity + QUANTITY_EPSILON {
                return Err(corrupt(format!(
                    "lot {} holds {} above its original {}",
                    lot.id, lot.quantity, lot.original_quantity
                )));
            }
            if lot.status != LotStatus::for_quantity(lot.quantity) {
                return Err(corrupt(format!(
                    "lot {} is {} with quantity {}",
                    lot.id,
                    lot.status.as_str(),
                    lot.quantity
                )));
            }
            if lot.unit.as_str().trim().is_empty() {
                return Err(corrupt(format!("lot {} has an empty unit", lot.id)));
            }

            let shape_ok = match lot.origin {
                LotOrigin::Intake => lot.parent_lot_id.is_none() && lot.inputs.is_empty(),
                LotOrigin::Subdivided => lot.parent_lot_id.is_some() && lot.inputs.is_empty(),
                LotOrigin::Processed => lot.parent_lot_id.is_none() && !lot.inputs.is_empty(),
            };
            if !shape_ok {
                return Err(corrupt(format!(
                    "lot {} references do not match origin {}",
                    lot.id,
                    lot.origin.as_str()
                )));
            }
            let references =
                lot.parent_lot_id.iter().chain(lot.inputs.iter().map(|input| &input.lot_id));
            for reference in references {
                if !seen.contains(reference) {
                    return Err(corrupt(format!(
                        "lot {} references {reference}, which is not created before it",
                        lot.id
                    )));
                }
            }

            if !seen.insert(&lot.id) {
                return Err(corrupt(format!("duplicate lot id {}", lot.id)));
            }
        }
        Ok(seen)
    }

    fn verify_processes(&self, lots: &BTreeSet<&LotId>) -> Result<BTreeSet<ProcessId>, TraceError> {
        let mut seen = BTreeSet::new();
        for process in &self.processes {
            if !seen.insert(process.process_id) {
                return Err(corrupt(format!("duplicate process id {}", process.process_id)));
            }
            let referenced = process
                .inputs
                .iter()
                .map(|input| &input.lot_id)
                .chain(process.outputs.iter());
            for lot_id in referenced {
                if !lots.contains(lot_id) {
                    return Err(corrupt(format!(
                        "process {} references unknown lot {lot_id}",
                        process.process_id
                    )));
                }
            }
            if process.kind == ProcessKind::Ship && process.shipment.is_none() {
                return Err(corrupt(format!(
                    "ship process {} has no shipment details",
                    process.process_id
                )));
            }
            if let Some(bad) = process.inputs.iter().find(|input| {
                !input.quantity.is_finite() || input.quantity <= 0.0
            }) {
                return Err(corrupt(format!(
                    "process {} consumes invalid quantity {} from {}",
                    process.process_id, bad.quantity, bad.lot_id
                )));
            }
        }
        Ok(seen)
    }

    fn verify_custody(
        &self,
        lots: &BTreeSet<&LotId>,
        processes: &BTreeSet<ProcessId>,
    ) -> Result<(), TraceError> {
        let mut previous = 0;
        for entry in &self.custody {
            if entry.sequence <= previous {
                return Err(corrupt(format!(
                    "custody sequence {} does not follow {previous}",
                    entry.sequence
                )));
            }
            previous = entry.sequence;
            if !lots.contains(&entry.lot_id) {
                return Err(corrupt(format!(
                    "custody entry {} references unknown lot {}",
                    entry.sequence, entry.lot_id
                )));
            }
            if let Some(process_id) = entry.process_id {
                if !processes.contains(&process_id) {
                    return Err(corrupt(format!(
                        "custody entry {} references unknown process {process_id}",
                        entry.sequence
                    )));
                }
            }
        }
        Ok(())
    }

    fn verify_reconciliation(&self) -> Result<(), TraceError> {
        let consumed: BTreeMap<&LotId, f64> = consumption_by_lot(&self.processes);
        for lot in &self.lots {
            let recorded = consumed.get(&lot.id).copied().unwrap_or(0.0);
            if !reconciles(lot.consumed(), recorded) {
                return Err(corrupt(format!(
                    "lot {} lost {} but processes account for {recorded}",
                    lot.id,
                    lot.consumed()
                )));
            }
        }
        Ok(())
    }
}
