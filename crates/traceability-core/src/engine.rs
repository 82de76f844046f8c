use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::custody::{CustodyAction, CustodyEntry, CustodyEntryId, CustodyLog};
use crate::error::TraceError;
use crate::lab::{LabTestCommand, LabTestId, LabTestRecord};
use crate::ledger::{LotFilter, LotLedger};
use crate::lineage::LineageGraph;
use crate::lot::{
    fits, require_positive, Category, Lot, LotId, LotInput, LotOrigin, NewLot, Unit,
};
use crate::process::{
    IntakeCommand, ProcessCommand, ProcessId, ProcessKind, ProcessRecord, Receipt, ShipCommand,
    Shipment, SubdivideCommand,
};
use crate::report::{self, CustodyReport, InventoryReport, MassBalance};
use crate::snapshot::{Snapshot, SNAPSHOT_FORMAT};

pub const DEFAULT_CATEGORIES: &[&str] = &[
    "Plant Material",
    "Biomass",
    "Concentrates",
    "Edibles",
    "Flower",
    "Prerolls",
    "Vapes",
    "Beverages",
    "Topicals",
];

pub const DEFAULT_UNITS: &[&str] = &["lbs", "kg", "g", "oz", "units"];

/// Business rules that vary per deployment. Empty sets disable the corresponding check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub categories: BTreeSet<String>,
    pub units: BTreeSet<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            categories: DEFAULT_CATEGORIES.iter().map(ToString::to_string).collect(),
            units: DEFAULT_UNITS.iter().map(ToString::to_string).collect(),
        }
    }
}

impl EngineConfig {
    /// Accept any non-blank category and unit.
    #[must_use]
    pub fn permissive() -> Self {
        Self { categories: BTreeSet::new(), units: BTreeSet::new() }
    }

    /// # Errors
    /// Returns [`TraceError::InvalidCategory`] for blank or unconfigured categories.
    pub fn category(&self, raw: &str) -> Result<Category, TraceError> {
        let category = Category::parse(raw)?;
        if !self.categories.is_empty() && !self.categories.contains(category.as_str()) {
            return Err(TraceError::InvalidCategory { category: category.to_string() });
        }
        Ok(category)
    }

    /// # Errors
    /// Returns [`TraceError::InvalidUnit`] for blank or unconfigured units.
    pub fn unit(&self, raw: &str) -> Result<Unit, TraceError> {
        let unit = Unit::parse(raw)?;
        let allowed = self.units.is_empty()
            || self.units.iter().any(|configured| configured.trim().to_lowercase() == unit.as_str());
        if !allowed {
            return Err(TraceError::InvalidUnit { unit: unit.to_string() });
        }
        Ok(unit)
    }
}

/// Everything one transaction writes, planned against a read of current state.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    /// Custody high-water mark the plan was made against.
    pub base_sequence: u64,
    pub consumed: Vec<LotInput>,
    pub created: Vec<Lot>,
    pub custody: Vec<CustodyEntry>,
    pub process: Option<ProcessRecord>,
    pub lab_test: Option<LabTestRecord>,
}

/// Durable write-ahead seam. A commit either persists the whole change set or none of it.
pub trait Journal: Send {
    /// # Errors
    /// Returns [`TraceError::Storage`] when the change could not be persisted.
    fn commit(&mut self, change: &ChangeSet) -> Result<(), TraceError>;
}

impl<J: Journal + ?Sized> Journal for &mut J {
    fn commit(&mut self, change: &ChangeSet) -> Result<(), TraceError> {
        (**self).commit(change)
    }
}

/// Journal for purely in-memory engines.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopJournal;

impl Journal for NoopJournal {
    fn commit(&mut self, _change: &ChangeSet) -> Result<(), TraceError> {
        Ok(())
    }
}

/// The four collections behind the engine, always mutually consistent between transactions.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    ledger: LotLedger,
    lineage: LineageGraph,
    custody: CustodyLog,
    processes: Vec<ProcessRecord>,
    lab_tests: Vec<LabTestRecord>,
}

impl Inventory {
    /// Rebuild in-memory state from a verified snapshot.
    ///
    /// # Errors
    /// Returns [`TraceError::CorruptSnapshot`] when the snapshot violates a ledger invariant.
    pub fn load(snapshot: Snapshot) -> Result<Self, TraceError> {
        snapshot.verify()?;
        let mut inventory = Self::default();
        for lot in snapshot.lots {
            inventory.ledger.restore(lot)?;
        }
        inventory.lineage = LineageGraph::rebuild(&inventory.ledger);
        for entry in snapshot.custody {
            inventory.custody.append(entry)?;
        }
        inventory.processes = snapshot.processes;
        inventory.lab_tests = snapshot.lab_tests;
        Ok(inventory)
    }

    #[must_use]
    pub fn ledger(&self) -> &LotLedger {
        &self.ledger
    }

    #[must_use]
    pub fn lineage(&self) -> &LineageGraph {
        &self.lineage
    }

    #[must_use]
    pub fn custody(&self) -> &CustodyLog {
        &self.custody
    }

    #[must_use]
    pub fn processes(&self) -> &[ProcessRecord] {
        &self.processes
    }

    #[must_use]
    pub fn lab_tests(&self) -> &[LabTestRecord] {
        &self.lab_tests
    }

    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            format: SNAPSHOT_FORMAT.to_string(),
            lots: self.ledger.iter().cloned().collect(),
            processes: self.processes.clone(),
            custody: self.custody.iter().cloned().collect(),
            lab_tests: self.lab_tests.clone(),
        }
    }

    /// Lots `lot_id` derives from, as full records.
    ///
    /// # Errors
    /// Returns [`TraceError::LotNotFound`] for an unknown lot.
    pub fn ancestors_of(&self, lot_id: &LotId) -> Result<Vec<Lot>, TraceError> {
        let ids = self.lineage.ancestors_of(&self.ledger, lot_id)?;
        Ok(self.resolve(&ids))
    }

    /// # Errors
    /// Returns [`TraceError::LotNotFound`] for an unknown lot.
    pub fn descendants_of(&self, lot_id: &LotId) -> Result<Vec<Lot>, TraceError> {
        let ids = self.lineage.descendants_of(&self.ledger, lot_id)?;
        Ok(self.resolve(&ids))
    }

    /// Custody entries of `lot_id` and all of its ancestors, in log order.
    ///
    /// # Errors
    /// Returns [`TraceError::LotNotFound`] for an unknown lot.
    pub fn chain_of_custody(&self, lot_id: &LotId) -> Result<Vec<CustodyEntry>, TraceError> {
        let mut lots = self
            .lineage
            .ancestors_of(&self.ledger, lot_id)?
            .into_iter()
            .collect::<BTreeSet<_>>();
        lots.insert(lot_id.clone());
        Ok(self.custody.history_of_all(&lots).into_iter().cloned().collect())
    }

    fn resolve(&self, ids: &[LotId]) -> Vec<Lot> {
        ids.iter().filter_map(|id| self.ledger.get(id)).cloned().collect()
    }

    fn apply(&mut self, change: ChangeSet) -> Result<(), TraceError> {
        self.ledger.consume_many(&change.consumed)?;
        for lot in change.created {
            let parent = lot.parent_lot_id.clone();
            let inputs = lot.inputs.iter().map(|input| input.lot_id.clone()).collect::<Vec<_>>();
            let id = lot.id.clone();
            self.ledger.restore(lot)?;
            if let Some(parent) = parent {
                self.lineage.record_subdivision(&self.ledger, &parent, std::slice::from_ref(&id))?;
            }
            if !inputs.is_empty() {
                self.lineage.record_process(&self.ledger, &inputs, &id)?;
            }
        }
        for entry in change.custody {
            self.custody.append(entry)?;
        }
        if let Some(process) = change.process {
            self.processes.push(process);
        }
        if let Some(lab_test) = change.lab_test {
            self.lab_tests.push(lab_test);
        }
        Ok(())
    }
}

/// Accumulates one transaction's writes while planning.
struct Draft {
    timestamp: OffsetDateTime,
    process_id: ProcessId,
    next_sequence: u64,
    change: ChangeSet,
}

impl Draft {
    fn new(inventory: &Inventory, occurred_at: Option<OffsetDateTime>) -> Self {
        let base_sequence = inventory.custody.high_water();
        Self {
            timestamp: occurred_at.unwrap_or_else(OffsetDateTime::now_utc),
            process_id: ProcessId::new(),
            next_sequence: base_sequence + 1,
            change: ChangeSet {
                base_sequence,
                consumed: Vec::new(),
                created: Vec::new(),
                custody: Vec::new(),
                process: None,
                lab_test: None,
            },
        }
    }

    fn custody(
        &mut self,
        lot_id: &LotId,
        action: CustodyAction,
        description: String,
        linked: bool,
    ) {
        self.change.custody.push(CustodyEntry {
            entry_id: CustodyEntryId::new(),
            sequence: self.next_sequence,
            lot_id: lot_id.clone(),
            action,
            description,
            timestamp: self.timestamp,
            process_id: linked.then_some(self.process_id),
        });
        self.next_sequence += 1;
    }

    fn process(
        mut self,
        kind: ProcessKind,
        inputs: Vec<LotInput>,
        outputs: Vec<LotId>,
        notes: Option<String>,
        shipment: Option<Shipment>,
    ) -> (ChangeSet, Receipt) {
        let record = ProcessRecord {
            process_id: self.process_id,
            kind,
            inputs,
            outputs,
            timestamp: self.timestamp,
            notes,
            shipment,
        };
        let receipt = Receipt::for_record(&record);
        self.change.process = Some(record);
        (self.change, receipt)
    }
}

fn non_blank(field: &str, value: &str) -> Result<String, TraceError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(TraceError::InvalidCommand(format!("{field} MUST be non-empty")));
    }
    Ok(trimmed.to_string())
}

fn optional_text(value: Option<&String>) -> Option<String> {
    value.map(|text| text.trim().to_string()).filter(|text| !text.is_empty())
}

fn join_ids<'a>(ids: impl Iterator<Item = &'a LotId>) -> String {
    ids.map(LotId::as_str).collect::<Vec<_>>().join(", ")
}

fn plan_intake(
    inventory: &Inventory,
    config: &EngineConfig,
    command: &IntakeCommand,
) -> Result<(ChangeSet, Receipt), TraceError> {
    let lot_id = LotId::parse(command.lot_id.as_str())?;
    let quantity = require_positive("intake quantity", command.quantity)?;
    let unit = config.unit(&command.unit)?;
    let category = config.category(&command.category)?;
    let vendor = optional_text(command.vendor.as_ref());

    let mut attributes = command.attributes.clone();
    if let Some(vendor) = &vendor {
        attributes.insert("vendor".to_string(), vendor.clone());
    }

    let mut draft = Draft::new(inventory, command.occurred_at);
    let new = NewLot {
        id: lot_id.clone(),
        quantity,
        unit: unit.clone(),
        category: category.clone(),
        product_type: optional_text(command.product_type.as_ref()),
        origin: LotOrigin::Intake,
        parent_lot_id: None,
        inputs: Vec::new(),
        created_at: draft.timestamp,
        attributes,
    };
    inventory.ledger.check_new(&new)?;

    let mut description = format!("received {quantity} {unit} of {category}");
    if let Some(vendor) = &vendor {
        description.push_str(&format!(" from {vendor}"));
    }
    draft.custody(&lot_id, CustodyAction::Intake, description, true);
    draft.change.created.push(new.into_lot());
    Ok(draft.process(
        ProcessKind::Intake,
        Vec::new(),
        vec![lot_id],
        optional_text(command.notes.as_ref()),
        None,
    ))
}

fn plan_subdivide(
    inventory: &Inventory,
    command: &SubdivideCommand,
) -> Result<(ChangeSet, Receipt), TraceError> {
    let parent_id = LotId::parse(command.parent_lot_id.as_str())?;
    if command.children.is_empty() {
        return Err(TraceError::InvalidCommand(
            "subdivide MUST name at least one child lot".to_string(),
        ));
    }
    let parent = inventory
        .ledger
        .get(&parent_id)
        .ok_or_else(|| TraceError::UnknownParent { lot_id: parent_id.clone() })?;

    let mut child_ids = BTreeSet::new();
    let mut children = Vec::with_capacity(command.children.len());
    let mut requested = 0.0;
    for child in &command.children {
        let child_id = LotId::parse(child.lot_id.as_str())?;
        let quantity = require_positive("child quantity", child.quantity)?;
        if child_id == parent_id
            || inventory.ledger.contains(&child_id)
            || !child_ids.insert(child_id.clone())
        {
            return Err(TraceError::DuplicateId { lot_id: child_id });
        }
        requested += quantity;
        children.push((child_id, quantity));
    }
    if !fits(requested, parent.quantity) {
        return Err(TraceError::OverAllocation {
            parent_lot_id: parent_id,
            requested,
            available: parent.quantity,
        });
    }

    let mut draft = Draft::new(inventory, command.occurred_at);
    for (child_id, quantity) in &children {
        let new = NewLot {
            id: child_id.clone(),
            quantity: *quantity,
            unit: parent.unit.clone(),
            category: parent.category.clone(),
            product_type: parent.product_type.clone(),
            origin: LotOrigin::Subdivided,
            parent_lot_id: Some(parent_id.clone()),
            inputs: Vec::new(),
            created_at: draft.timestamp,
            attributes: parent.attributes.clone(),
        };
        inventory.ledger.check_new(&new)?;
        draft.custody(
            child_id,
            CustodyAction::Subdivided,
            format!("created from parent {parent_id} ({quantity} {})", parent.unit),
            true,
        );
        draft.change.created.push(new.into_lot());
    }
    let outputs = children.into_iter().map(|(child_id, _)| child_id).collect::<Vec<_>>();
    draft.custody(
        &parent_id,
        CustodyAction::Subdivided,
        format!("split into {} children: {}", outputs.len(), join_ids(outputs.iter())),
        true,
    );

    let consumed = vec![LotInput { lot_id: parent_id, quantity: requested }];
    draft.change.consumed.clone_from(&consumed);
    Ok(draft.process(
        ProcessKind::Subdivide,
        consumed,
        outputs,
        optional_text(command.notes.as_ref()),
        None,
    ))
}

fn plan_process(
    inventory: &Inventory,
    config: &EngineConfig,
    command: &ProcessCommand,
) -> Result<(ChangeSet, Receipt), TraceError> {
    let kind = ProcessKind::from(command.kind);
    if command.inputs.is_empty() {
        return Err(TraceError::InvalidCommand(format!(
            "{} MUST consume at least one input lot",
            kind.as_str()
        )));
    }

    let mut inputs = Vec::with_capacity(command.inputs.len());
    for input in &command.inputs {
        let lot_id = LotId::parse(input.lot_id.as_str())?;
        if !inventory.ledger.contains(&lot_id) {
            return Err(TraceError::UnknownInput { lot_id });
        }
        inputs.push(LotInput { lot_id, quantity: input.quantity });
    }

    let output_id = LotId::parse(command.output.lot_id.as_str())?;
    if inputs.iter().any(|input| input.lot_id == output_id) {
        return Err(TraceError::InvalidCommand(format!(
            "output lot {output_id} MUST NOT also be an input"
        )));
    }
    let quantity = require_positive("output quantity", command.output.quantity)?;
    let unit = config.unit(&command.output.unit)?;
    let category = config.category(&command.output.category)?;
    inventory.ledger.check_consumptions(&inputs)?;

    let mut draft = Draft::new(inventory, command.occurred_at);
    let new = NewLot {
        id: output_id.clone(),
        quantity,
        unit: unit.clone(),
        category: category.clone(),
        product_type: optional_text(command.output.product_type.as_ref()),
        origin: LotOrigin::Processed,
        parent_lot_id: None,
        inputs: inputs.clone(),
        created_at: draft.timestamp,
        attributes: command.output.attributes.clone(),
    };
    inventory.ledger.check_new(&new)?;

    for input in &inputs {
        let source_unit = inventory.ledger.get(&input.lot_id).map_or("", |lot| lot.unit.as_str());
        draft.custody(
            &input.lot_id,
            CustodyAction::Used,
            format!("used {} {source_unit} in {} into {output_id}", input.quantity, kind.as_str()),
            true,
        );
    }
    draft.custody(
        &output_id,
        CustodyAction::Processed,
        format!(
            "{} produced {quantity} {unit} of {category} from {}",
            kind.as_str(),
            join_ids(inputs.iter().map(|input| &input.lot_id))
        ),
        true,
    );
    draft.change.created.push(new.into_lot());
    draft.change.consumed.clone_from(&inputs);
    Ok(draft.process(kind, inputs, vec![output_id], optional_text(command.notes.as_ref()), None))
}

fn plan_ship(
    inventory: &Inventory,
    command: &ShipCommand,
) -> Result<(ChangeSet, Receipt), TraceError> {
    let lot_id = LotId::parse(command.lot_id.as_str())?;
    let lot = inventory.ledger.require(&lot_id)?;
    let quantity = require_positive("shipped quantity", command.quantity)?;
    let recipient = non_blank("recipient", &command.recipient)?;
    let consumed = vec![LotInput { lot_id: lot_id.clone(), quantity }];
    inventory.ledger.check_consumptions(&consumed)?;

    let shipment = Shipment {
        recipient,
        address: optional_text(command.address.as_ref()),
        carrier: optional_text(command.carrier.as_ref()),
        tracking_number: optional_text(command.tracking_number.as_ref()),
    };
    let mut description = format!("shipped {quantity} {} to {}", lot.unit, shipment.recipient);
    if let Some(carrier) = &shipment.carrier {
        description.push_str(&format!(" via {carrier}"));
    }
    if let Some(tracking) = &shipment.tracking_number {
        description.push_str(&format!(" (tracking {tracking})"));
    }

    let mut draft = Draft::new(inventory, command.occurred_at);
    draft.custody(&lot_id, CustodyAction::Shipped, description, true);
    draft.change.consumed.clone_from(&consumed);
    Ok(draft.process(
        ProcessKind::Ship,
        consumed,
        Vec::new(),
        optional_text(command.notes.as_ref()),
        Some(shipment),
    ))
}

fn plan_lab_test(
    inventory: &Inventory,
    command: &LabTestCommand,
) -> Result<(ChangeSet, LabTestRecord), TraceError> {
    let lot_id = LotId::parse(command.lot_id.as_str())?;
    inventory.ledger.require(&lot_id)?;
    let test_type = non_blank("test_type", &command.test_type)?;
    let lab_name = non_blank("lab_name", &command.lab_name)?;

    let mut draft = Draft::new(inventory, command.occurred_at);
    let record = LabTestRecord {
        test_id: LabTestId::new(),
        lot_id: lot_id.clone(),
        test_type,
        lab_name,
        certificate_number: optional_text(command.certificate_number.as_ref()),
        passed: command.passed,
        results: command.results.clone(),
        notes: optional_text(command.notes.as_ref()),
        tested_at: draft.timestamp,
    };
    let mut description =
        format!("{} by {}: {}", record.test_type, record.lab_name, record.verdict());
    if let Some(certificate) = &record.certificate_number {
        description.push_str(&format!(" (certificate {certificate})"));
    }
    draft.custody(&lot_id, CustodyAction::Tested, description, false);
    draft.change.lab_test = Some(record.clone());
    Ok((draft.change, record))
}

/// Runs commands as atomic transactions against an [`Inventory`].
///
/// Writers serialize on the inventory write lock; the journal lock is only ever taken while
/// holding it. Readers never observe a half-applied transaction.
#[derive(Debug)]
pub struct ProcessEngine<J: Journal = NoopJournal> {
    config: EngineConfig,
    state: RwLock<Inventory>,
    journal: Mutex<J>,
}

impl ProcessEngine<NoopJournal> {
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self::with_journal(config, NoopJournal)
    }
}

impl<J: Journal> ProcessEngine<J> {
    #[must_use]
    pub fn with_journal(config: EngineConfig, journal: J) -> Self {
        Self {
            config,
            state: RwLock::new(Inventory::default()),
            journal: Mutex::new(journal),
        }
    }

    /// Start from persisted state.
    ///
    /// # Errors
    /// Returns [`TraceError::CorruptSnapshot`] when the snapshot fails verification.
    pub fn from_snapshot(
        config: EngineConfig,
        snapshot: Snapshot,
        journal: J,
    ) -> Result<Self, TraceError> {
        let inventory = Inventory::load(snapshot)?;
        tracing::debug!(
            lots = inventory.ledger.len(),
            custody_entries = inventory.custody.len(),
            "loaded ledger snapshot"
        );
        Ok(Self { config, state: RwLock::new(inventory), journal: Mutex::new(journal) })
    }

    /// Resume from state that was already verified, e.g. the result of [`Self::into_inventory`].
    #[must_use]
    pub fn from_inventory(config: EngineConfig, inventory: Inventory, journal: J) -> Self {
        Self { config, state: RwLock::new(inventory), journal: Mutex::new(journal) }
    }

    /// Give back the in-memory state, dropping the journal.
    #[must_use]
    pub fn into_inventory(self) -> Inventory {
        self.state.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run `read` against a consistent view of current state.
    pub fn read<T>(&self, read: impl FnOnce(&Inventory) -> T) -> T {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        read(&state)
    }

    /// # Errors
    /// Returns [`TraceError::DuplicateId`], [`TraceError::InvalidQuantity`],
    /// [`TraceError::InvalidUnit`], [`TraceError::InvalidCategory`],
    /// [`TraceError::InvalidCommand`] or [`TraceError::Storage`].
    pub fn intake(&self, command: &IntakeCommand) -> Result<Receipt, TraceError> {
        self.transact(ProcessKind::Intake, |inventory| plan_intake(inventory, &self.config, command))
    }

    /// Split one lot into children that inherit its unit, category and attributes.
    ///
    /// # Errors
    /// Returns [`TraceError::UnknownParent`], [`TraceError::DuplicateId`],
    /// [`TraceError::InvalidQuantity`], [`TraceError::OverAllocation`],
    /// [`TraceError::InvalidCommand`] or [`TraceError::Storage`].
    pub fn subdivide(&self, command: &SubdivideCommand) -> Result<Receipt, TraceError> {
        self.transact(ProcessKind::Subdivide, |inventory| plan_subdivide(inventory, command))
    }

    /// Consume N inputs into one new output lot (snowcap, blend, convert).
    ///
    /// # Errors
    /// Returns [`TraceError::UnknownInput`], [`TraceError::InsufficientQuantity`],
    /// [`TraceError::DuplicateId`], [`TraceError::InvalidQuantity`],
    /// [`TraceError::InvalidUnit`], [`TraceError::InvalidCategory`],
    /// [`TraceError::InvalidCommand`] or [`TraceError::Storage`].
    pub fn process(&self, command: &ProcessCommand) -> Result<Receipt, TraceError> {
        self.transact(command.kind.into(), |inventory| {
            plan_process(inventory, &self.config, command)
        })
    }

    /// # Errors
    /// Returns [`TraceError::LotNotFound`], [`TraceError::InsufficientQuantity`],
    /// [`TraceError::InvalidQuantity`], [`TraceError::InvalidCommand`] or
    /// [`TraceError::Storage`].
    pub fn ship(&self, command: &ShipCommand) -> Result<Receipt, TraceError> {
        self.transact(ProcessKind::Ship, |inventory| plan_ship(inventory, command))
    }

    /// # Errors
    /// Returns [`TraceError::LotNotFound`], [`TraceError::InvalidCommand`] or
    /// [`TraceError::Storage`].
    pub fn record_lab_test(&self, command: &LabTestCommand) -> Result<LabTestRecord, TraceError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let (change, record) = plan_lab_test(&state, command).inspect_err(|err| {
            tracing::debug!(error_kind = err.kind(), "lab test rejected");
        })?;
        self.commit(&mut state, change)?;
        tracing::info!(lot_id = %record.lot_id, test_id = %record.test_id, "recorded lab test");
        Ok(record)
    }

    /// # Errors
    /// Returns [`TraceError::LotNotFound`] for an unknown lot.
    pub fn get_lot(&self, lot_id: &LotId) -> Result<Lot, TraceError> {
        self.read(|inventory| inventory.ledger.require(lot_id).cloned())
    }

    #[must_use]
    pub fn list_lots(&self, filter: &LotFilter) -> Vec<Lot> {
        self.read(|inventory| inventory.ledger.list(filter).cloned().collect())
    }

    /// Custody entries for `lot_id`; empty for a lot with no history.
    #[must_use]
    pub fn history_of(&self, lot_id: &LotId) -> Vec<CustodyEntry> {
        self.read(|inventory| inventory.custody.history_of(lot_id).cloned().collect())
    }

    /// # Errors
    /// Returns [`TraceError::LotNotFound`] for an unknown lot.
    pub fn chain_of_custody(&self, lot_id: &LotId) -> Result<Vec<CustodyEntry>, TraceError> {
        self.read(|inventory| inventory.chain_of_custody(lot_id))
    }

    /// # Errors
    /// Returns [`TraceError::LotNotFound`] for an unknown lot.
    pub fn ancestors_of(&self, lot_id: &LotId) -> Result<Vec<Lot>, TraceError> {
        self.read(|inventory| inventory.ancestors_of(lot_id))
    }

    /// # Errors
    /// Returns [`TraceError::LotNotFound`] for an unknown lot.
    pub fn descendants_of(&self, lot_id: &LotId) -> Result<Vec<Lot>, TraceError> {
        self.read(|inventory| inventory.descendants_of(lot_id))
    }

    /// # Errors
    /// Returns [`TraceError::LotNotFound`] for an unknown lot.
    pub fn lab_tests_of(&self, lot_id: &LotId) -> Result<Vec<LabTestRecord>, TraceError> {
        self.read(|inventory| {
            inventory.ledger.require(lot_id)?;
            Ok(inventory.lab_tests.iter().filter(|test| &test.lot_id == lot_id).cloned().collect())
        })
    }

    #[must_use]
    pub fn processes(&self) -> Vec<ProcessRecord> {
        self.read(|inventory| inventory.processes.clone())
    }

    /// Internally consistent copy of all state.
    #[must_use]
    pub fn export_all(&self) -> Snapshot {
        self.read(Inventory::snapshot)
    }

    /// # Errors
    /// Returns [`TraceError::LotNotFound`] for an unknown lot.
    pub fn mass_balance(&self, lot_id: &LotId) -> Result<MassBalance, TraceError> {
        self.read(|inventory| report::mass_balance(inventory, lot_id))
    }

    #[must_use]
    pub fn inventory_report(&self) -> InventoryReport {
        self.read(report::inventory_report)
    }

    #[must_use]
    pub fn custody_report(&self) -> CustodyReport {
        self.read(report::custody_report)
    }

    fn transact(
        &self,
        kind: ProcessKind,
        plan: impl FnOnce(&Inventory) -> Result<(ChangeSet, Receipt), TraceError>,
    ) -> Result<Receipt, TraceError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let (change, receipt) = plan(&state).inspect_err(|err| {
            tracing::debug!(kind = kind.as_str(), error_kind = err.kind(), "command rejected");
        })?;
        self.commit(&mut state, change)?;
        tracing::info!(
            process_id = %receipt.process_id,
            kind = kind.as_str(),
            created = %join_ids(receipt.created.iter()),
            consumed = %join_ids(receipt.consumed.iter().map(|input| &input.lot_id)),
            "committed transaction"
        );
        Ok(receipt)
    }

    fn commit(&self, state: &mut Inventory, change: ChangeSet) -> Result<(), TraceError> {
        let mut journal = self.journal.lock().unwrap_or_else(PoisonError::into_inner);
        journal.commit(&change).inspect_err(|err| {
            tracing::warn!(error = %err, "journal commit failed; ledger left unchanged");
        })?;
        state.apply(change)
    }
}

/// Totals of consumption per lot recorded across process records.
pub(crate) fn consumption_by_lot(processes: &[ProcessRecord]) -> BTreeMap<&LotId, f64> {
    let mut totals = BTreeMap::new();
    for process in processes {
        for input in &process.inputs {
            *totals.entry(&input.lot_id).or_insert(0.0) += input.quantity;
        }
    }
    totals
}
