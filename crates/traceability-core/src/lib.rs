//! Lot lineage and quantity-conservation engine for hemp/cannabis traceability.
//!
//! Material enters as intake lots, is split into child lots, transformed into new lots
//! (snowcap, blend, convert) and shipped out. Every transaction is planned against a
//! consistent read, journaled, then applied in memory as one unit, and leaves an append-only
//! custody trail behind.

pub mod custody;
pub mod engine;
pub mod error;
pub mod lab;
pub mod ledger;
pub mod lineage;
pub mod lot;
pub mod process;
pub mod report;
pub mod snapshot;

pub use custody::{CustodyAction, CustodyEntry, CustodyEntryId, CustodyLog, LedgerMark};
pub use engine::{
    ChangeSet, EngineConfig, Inventory, Journal, NoopJournal, ProcessEngine, DEFAULT_CATEGORIES,
    DEFAULT_UNITS,
};
pub use error::TraceError;
pub use lab::{LabTestCommand, LabTestId, LabTestRecord};
pub use ledger::{LotFilter, LotLedger, LotOrder};
pub use lineage::{EdgeKind, LineageEdge, LineageGraph, MAX_LINEAGE_DEPTH};
pub use lot::{
    Attributes, Category, Lot, LotId, LotInput, LotOrigin, LotStatus, NewLot, Unit,
    QUANTITY_EPSILON,
};
pub use process::{
    ChildSpec, IntakeCommand, OutputSpec, ProcessCommand, ProcessId, ProcessKind, ProcessRecord,
    Receipt, ShipCommand, Shipment, SubdivideCommand, TransformKind,
};
pub use report::{
    CustodyReport, InventoryLine, InventoryReport, InventoryTotal, LotCustody, MassBalance,
};
pub use snapshot::{Snapshot, SNAPSHOT_FORMAT};

#[cfg(test)]
pub(crate) mod fixtures {
    use time::{Duration, OffsetDateTime};

    use crate::lot::{Attributes, Category, LotId, LotInput, LotOrigin, NewLot, Unit};
    use crate::process::{
        ChildSpec, IntakeCommand, OutputSpec, ProcessCommand, ShipCommand, SubdivideCommand,
        TransformKind,
    };

    pub fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_760_000_000)
    }

    pub fn unit(raw: &str) -> Unit {
        match Unit::parse(raw) {
            Ok(unit) => unit,
            Err(err) => panic!("invalid fixture unit {raw}: {err}"),
        }
    }

    pub fn category(raw: &str) -> Category {
        match Category::parse(raw) {
            Ok(category) => category,
            Err(err) => panic!("invalid fixture category {raw}: {err}"),
        }
    }

    pub fn intake_lot(id: &str, quantity: f64) -> NewLot {
        NewLot {
            id: LotId::from(id),
            quantity,
            unit: unit("lbs"),
            category: category("Plant Material"),
            product_type: None,
            origin: LotOrigin::Intake,
            parent_lot_id: None,
            inputs: Vec::new(),
            created_at: fixture_time(),
            attributes: Attributes::new(),
        }
    }

    pub fn intake(id: &str, quantity: f64) -> IntakeCommand {
        IntakeCommand {
            lot_id: LotId::from(id),
            quantity,
            unit: "lbs".to_string(),
            category: "Plant Material".to_string(),
            product_type: Some("flower".to_string()),
            vendor: Some("Green Acres".to_string()),
            attributes: Attributes::new(),
            notes: None,
            occurred_at: Some(fixture_time()),
        }
    }

    pub fn subdivide(parent: &str, children: &[(&str, f64)]) -> SubdivideCommand {
        SubdivideCommand {
            parent_lot_id: LotId::from(parent),
            children: children
                .iter()
                .map(|(id, quantity)| ChildSpec { lot_id: LotId::from(*id), quantity: *quantity })
                .collect(),
            notes: None,
            occurred_at: Some(fixture_time()),
        }
    }

    pub fn process(
        kind: TransformKind,
        inputs: &[(&str, f64)],
        output: &str,
        quantity: f64,
    ) -> ProcessCommand {
        ProcessCommand {
            kind,
            inputs: inputs
                .iter()
                .map(|(id, quantity)| LotInput { lot_id: LotId::from(*id), quantity: *quantity })
                .collect(),
            output: OutputSpec {
                lot_id: LotId::from(output),
                quantity,
                unit: "lbs".to_string(),
                category: "Concentrates".to_string(),
                product_type: Some("vape".to_string()),
                attributes: Attributes::new(),
            },
            notes: None,
            occurred_at: Some(fixture_time()),
        }
    }

    pub fn ship(id: &str, quantity: f64) -> ShipCommand {
        ShipCommand {
            lot_id: LotId::from(id),
            quantity,
            recipient: "Acme Dispensary".to_string(),
            address: None,
            carrier: None,
            tracking_number: None,
            notes: None,
            occurred_at: Some(fixture_time()),
        }
    }
}
