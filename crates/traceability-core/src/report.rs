use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::custody::CustodyEntry;
use crate::engine::Inventory;
use crate::error::TraceError;
use crate::lot::{Category, LotId, LotOrigin, LotStatus, Unit};
use crate::process::ProcessKind;
use crate::snapshot::reconciles;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InventoryLine {
    pub lot_id: LotId,
    pub category: Category,
    pub product_type: Option<String>,
    pub origin: LotOrigin,
    pub unit: Unit,
    pub quantity: f64,
    pub original_quantity: f64,
}

/// On-hand total for one category in one unit. Units are never summed together.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InventoryTotal {
    pub category: Category,
    pub unit: Unit,
    pub lots: usize,
    pub quantity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InventoryReport {
    pub lots: Vec<InventoryLine>,
    pub totals: Vec<InventoryTotal>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LotCustody {
    pub lot_id: LotId,
    pub status: LotStatus,
    pub entries: Vec<CustodyEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CustodyReport {
    pub lots: Vec<LotCustody>,
}

/// Where every unit that entered a lot's subdivision tree went.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MassBalance {
    pub lot_id: LotId,
    pub unit: Unit,
    pub original: f64,
    pub on_hand: f64,
    pub shipped: f64,
    pub transformed: f64,
    pub balanced: bool,
}

#[must_use]
pub fn inventory_report(inventory: &Inventory) -> InventoryReport {
    let mut totals: BTreeMap<(Category, Unit), (usize, f64)> = BTreeMap::new();
    let lots = inventory
        .ledger()
        .list_active()
        .map(|lot| {
            let total = totals.entry((lot.category.clone(), lot.unit.clone())).or_insert((0, 0.0));
            total.0 += 1;
            total.1 += lot.quantity;
            InventoryLine {
                lot_id: lot.id.clone(),
                category: lot.category.clone(),
                product_type: lot.product_type.clone(),
                origin: lot.origin,
                unit: lot.unit.clone(),
                quantity: lot.quantity,
                original_quantity: lot.original_quantity,
            }
        })
        .collect();
    let totals = totals
        .into_iter()
        .map(|((category, unit), (lots, quantity))| InventoryTotal { category, unit, lots, quantity })
        .collect();
    InventoryReport { lots, totals }
}

#[must_use]
pub fn custody_report(inventory: &Inventory) -> CustodyReport {
    let lots = inventory
        .ledger()
        .iter()
        .map(|lot| LotCustody {
            lot_id: lot.id.clone(),
            status: lot.status,
            entries: inventory.custody().history_of(&lot.id).cloned().collect(),
        })
        .collect();
    CustodyReport { lots }
}

/// Account for `lot_id`'s original quantity across its subdivision subtree.
///
/// Subdivision moves quantity within the subtree, so only shipments and transformations
/// out of the subtree count as outflow.
///
/// # Errors
/// Returns [`TraceError::LotNotFound`] for an unknown lot.
pub fn mass_balance(inventory: &Inventory, lot_id: &LotId) -> Result<MassBalance, TraceError> {
    let root = inventory.ledger().require(lot_id)?;
    let mut subtree = inventory.lineage().subdivision_subtree(lot_id);
    subtree.push(lot_id.clone());

    let on_hand = subtree
        .iter()
        .filter_map(|id| inventory.ledger().get(id))
        .map(|lot| lot.quantity)
        .sum::<f64>();

    let mut shipped = 0.0;
    let mut transformed = 0.0;
    for process in inventory.processes() {
        let outflow = process
            .inputs
            .iter()
            .filter(|input| subtree.contains(&input.lot_id))
            .map(|input| input.quantity)
            .sum::<f64>();
        if process.kind.is_transform() {
            transformed += outflow;
        } else if process.kind == ProcessKind::Ship {
            shipped += outflow;
        }
    }

    Ok(MassBalance {
        lot_id: lot_id.clone(),
        unit: root.unit.clone(),
        original: root.original_quantity,
        on_hand,
        shipped,
        transformed,
        balanced: reconciles(root.original_quantity, on_hand + shipped + transformed),
    })
}
