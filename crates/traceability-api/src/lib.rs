//! Facade shared by `lotctl` and the HTTP service.
//!
//! A [`TraceabilityApi`] keeps one `SQLite` connection and the verified in-memory ledger
//! between calls. Each call compares the newest persisted custody entry against the cached
//! one and reloads only when another connection committed in between. Commands run under
//! the database write lock, so concurrent writers in this process or another plan against
//! current state and never against a stale copy.

pub mod config;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use traceability_core::{
    CustodyEntry, CustodyReport, EngineConfig, IntakeCommand, Inventory, InventoryReport,
    LabTestCommand, LabTestRecord, Lot, LotFilter, LotId, MassBalance, ProcessCommand,
    ProcessEngine, ProcessRecord, Receipt, ShipCommand, SubdivideCommand, TraceError,
};
use traceability_store_sqlite::SqliteStore;

pub use config::{TraceabilityConfig, DEFAULT_CONFIG_FILE, DEFAULT_DATABASE};
pub use traceability_store_sqlite::{
    ExportFileDigest, ExportManifest, ForeignKeyViolation, ImportSummary, IntegrityReport,
    SchemaStatus,
};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Open connection plus the ledger state it last saw.
#[derive(Debug)]
struct Session {
    store: SqliteStore,
    inventory: Inventory,
}

impl Session {
    fn open(db_path: &Path) -> Result<Self> {
        let mut store = SqliteStore::open(db_path)?;
        store.migrate()?;
        let inventory = Inventory::load(store.load_snapshot()?)?;
        tracing::debug!(
            db = %db_path.display(),
            lots = inventory.ledger().len(),
            "opened ledger session"
        );
        Ok(Self { store, inventory })
    }
}

fn refresh(store: &SqliteStore, inventory: &mut Inventory) -> Result<()> {
    let persisted = store.ledger_mark()?;
    let cached = inventory.custody().mark();
    if persisted != cached {
        tracing::debug!(
            persisted = persisted.high_water,
            cached = cached.high_water,
            "ledger changed elsewhere; reloading"
        );
        *inventory = Inventory::load(store.load_snapshot()?)?;
    }
    Ok(())
}

/// Clones share one session, so they also share its connection and cache.
#[derive(Debug, Clone)]
pub struct TraceabilityApi {
    db_path: PathBuf,
    engine_config: EngineConfig,
    session: Arc<Mutex<Option<Session>>>,
}

impl TraceabilityApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path, engine_config: EngineConfig::default(), session: Arc::default() }
    }

    #[must_use]
    pub fn from_config(config: &TraceabilityConfig) -> Self {
        Self::new(config.database.clone()).with_engine_config(config.engine.clone())
    }

    #[must_use]
    pub fn with_engine_config(mut self, engine_config: EngineConfig) -> Self {
        self.engine_config = engine_config;
        self
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_session<T>(&self, run: impl FnOnce(&mut Session) -> Result<T>) -> Result<T> {
        let mut guard = self.lock_session();
        let session = match guard.take() {
            Some(session) => session,
            None => Session::open(&self.db_path)?,
        };
        run(guard.insert(session))
    }

    /// Run one command under the database write lock, against freshly checked state.
    fn write<T>(
        &self,
        command: impl FnOnce(&ProcessEngine<&mut SqliteStore>) -> Result<T, TraceError>,
    ) -> Result<T> {
        self.with_session(|Session { store, inventory }| {
            store.write_locked(|store| {
                refresh(store, inventory)?;
                let engine = ProcessEngine::from_inventory(
                    self.engine_config.clone(),
                    std::mem::take(inventory),
                    store,
                );
                let outcome = command(&engine);
                *inventory = engine.into_inventory();
                Ok(outcome?)
            })
        })
    }

    fn read<T>(&self, query: impl FnOnce(&ProcessEngine) -> Result<T, TraceError>) -> Result<T> {
        self.with_session(|Session { store, inventory }| {
            refresh(store, inventory)?;
            let engine = ProcessEngine::from_inventory(
                self.engine_config.clone(),
                std::mem::take(inventory),
                traceability_core::NoopJournal,
            );
            let outcome = query(&engine);
            *inventory = engine.into_inventory();
            Ok(outcome?)
        })
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.open_store()?.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                after_version: None,
                up_to_date: None,
            });
        }

        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: before.pending_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when migration or writing the export directory fails.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.export_snapshot(out_dir)
    }

    /// # Errors
    /// Returns an error when the export fails manifest or ledger verification, or the
    /// target database already holds data.
    pub fn import_snapshot(&self, in_dir: &Path) -> Result<ImportSummary> {
        let mut session = self.lock_session();
        *session = None;
        self.open_store()?.import_snapshot(in_dir)
    }

    /// # Errors
    /// Returns an error when migration or the `SQLite` backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.backup_database(out_file)
    }

    /// # Errors
    /// Returns an error when the backup file is missing or restore fails.
    pub fn restore_database(&self, in_file: &Path) -> Result<SchemaStatus> {
        let mut session = self.lock_session();
        *session = None;
        let mut store = self.open_store()?;
        store.restore_database(in_file)?;
        store.schema_status()
    }

    /// # Errors
    /// Returns an error when an integrity probe cannot run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.integrity_check()
    }

    /// Receive raw material as a new intake lot.
    ///
    /// # Errors
    /// Returns the engine's [`traceability_core::TraceError`] wrapped in `anyhow`, or a
    /// storage error.
    pub fn intake(&self, command: &IntakeCommand) -> Result<Receipt> {
        self.write(|engine| engine.intake(command))
    }

    /// # Errors
    /// Same as [`TraceabilityApi::intake`].
    pub fn subdivide(&self, command: &SubdivideCommand) -> Result<Receipt> {
        self.write(|engine| engine.subdivide(command))
    }

    /// # Errors
    /// Same as [`TraceabilityApi::intake`].
    pub fn process(&self, command: &ProcessCommand) -> Result<Receipt> {
        self.write(|engine| engine.process(command))
    }

    /// # Errors
    /// Same as [`TraceabilityApi::intake`].
    pub fn ship(&self, command: &ShipCommand) -> Result<Receipt> {
        self.write(|engine| engine.ship(command))
    }

    /// # Errors
    /// Same as [`TraceabilityApi::intake`].
    pub fn record_lab_test(&self, command: &LabTestCommand) -> Result<LabTestRecord> {
        self.write(|engine| engine.record_lab_test(command))
    }

    /// # Errors
    /// Returns `LotNotFound` for unknown lots.
    pub fn get_lot(&self, lot_id: &LotId) -> Result<Lot> {
        self.read(|engine| engine.get_lot(lot_id))
    }

    /// # Errors
    /// Returns an error when the ledger cannot be loaded.
    pub fn list_lots(&self, filter: &LotFilter) -> Result<Vec<Lot>> {
        self.read(|engine| Ok(engine.list_lots(filter)))
    }

    /// Custody entries recorded directly against `lot_id`, oldest first.
    ///
    /// # Errors
    /// Returns `LotNotFound` for unknown lots.
    pub fn history_of(&self, lot_id: &LotId) -> Result<Vec<CustodyEntry>> {
        self.read(|engine| {
            engine.get_lot(lot_id)?;
            Ok(engine.history_of(lot_id))
        })
    }

    /// # Errors
    /// Returns `LotNotFound` for unknown lots.
    pub fn chain_of_custody(&self, lot_id: &LotId) -> Result<Vec<CustodyEntry>> {
        self.read(|engine| engine.chain_of_custody(lot_id))
    }

    /// # Errors
    /// Returns `LotNotFound` for unknown lots.
    pub fn ancestors_of(&self, lot_id: &LotId) -> Result<Vec<Lot>> {
        self.read(|engine| engine.ancestors_of(lot_id))
    }

    /// # Errors
    /// Returns `LotNotFound` for unknown lots.
    pub fn descendants_of(&self, lot_id: &LotId) -> Result<Vec<Lot>> {
        self.read(|engine| engine.descendants_of(lot_id))
    }

    /// # Errors
    /// Returns `LotNotFound` for unknown lots.
    pub fn lab_tests_of(&self, lot_id: &LotId) -> Result<Vec<LabTestRecord>> {
        self.read(|engine| engine.lab_tests_of(lot_id))
    }

    /// # Errors
    /// Returns an error when the ledger cannot be loaded.
    pub fn processes(&self) -> Result<Vec<ProcessRecord>> {
        self.read(|engine| Ok(engine.processes()))
    }

    /// # Errors
    /// Returns `LotNotFound` for unknown lots.
    pub fn mass_balance(&self, lot_id: &LotId) -> Result<MassBalance> {
        self.read(|engine| engine.mass_balance(lot_id))
    }

    /// # Errors
    /// Returns an error when the ledger cannot be loaded.
    pub fn inventory_report(&self) -> Result<InventoryReport> {
        self.read(|engine| Ok(engine.inventory_report()))
    }

    /// # Errors
    /// Returns an error when the ledger cannot be loaded.
    pub fn custody_report(&self) -> Result<CustodyReport> {
        self.read(|engine| Ok(engine.custody_report()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use traceability_core::{
        Attributes, ChildSpec, CustodyAction, LotInput, LotStatus, OutputSpec, TraceError,
        TransformKind,
    };
    use ulid::Ulid;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("traceability-api-{}.sqlite3", Ulid::new()))
    }

    fn cleanup(db_path: &Path) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", db_path.display()));
        }
    }

    fn intake(lot_id: &str, quantity: f64, category: &str) -> IntakeCommand {
        IntakeCommand {
            lot_id: LotId::from(lot_id),
            quantity,
            unit: "lbs".to_string(),
            category: category.to_string(),
            product_type: None,
            vendor: Some("Hilltop Farms".to_string()),
            attributes: Attributes::new(),
            notes: None,
            occurred_at: None,
        }
    }

    fn trace_error(err: &anyhow::Error) -> Option<&TraceError> {
        err.downcast_ref::<TraceError>()
    }

    #[test]
    fn api_commands_persist_between_calls() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = TraceabilityApi::new(db_path.clone());

        api.intake(&intake("BIO-1", 100.0, "Biomass"))?;
        api.subdivide(&SubdivideCommand {
            parent_lot_id: LotId::from("BIO-1"),
            children: vec![
                ChildSpec { lot_id: LotId::from("BIO-1-A"), quantity: 70.0 },
                ChildSpec { lot_id: LotId::from("BIO-1-B"), quantity: 30.0 },
            ],
            notes: None,
            occurred_at: None,
        })?;
        let receipt = api.process(&ProcessCommand {
            kind: TransformKind::Convert,
            inputs: vec![LotInput { lot_id: LotId::from("BIO-1-A"), quantity: 70.0 }],
            output: OutputSpec {
                lot_id: LotId::from("DIST-1"),
                quantity: 7.5,
                unit: "kg".to_string(),
                category: "Concentrates".to_string(),
                product_type: Some("distillate".to_string()),
                attributes: Attributes::new(),
            },
            notes: Some("short path run 12".to_string()),
            occurred_at: None,
        })?;
        assert_eq!(receipt.created, vec![LotId::from("DIST-1")]);

        api.ship(&ShipCommand {
            lot_id: LotId::from("BIO-1-B"),
            quantity: 30.0,
            recipient: "North Coast Extracts".to_string(),
            address: None,
            carrier: None,
            tracking_number: None,
            notes: None,
            occurred_at: None,
        })?;
        api.record_lab_test(&LabTestCommand {
            lot_id: LotId::from("DIST-1"),
            test_type: "potency".to_string(),
            lab_name: "Evio Labs".to_string(),
            certificate_number: None,
            passed: true,
            results: BTreeMap::new(),
            notes: None,
            occurred_at: None,
        })?;

        assert_eq!(api.get_lot(&LotId::from("BIO-1"))?.status, LotStatus::Depleted);
        assert_eq!(api.get_lot(&LotId::from("BIO-1-B"))?.status, LotStatus::Depleted);
        let ancestors = api.ancestors_of(&LotId::from("DIST-1"))?;
        let ids = ancestors.iter().map(|lot| lot.id.to_string()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["BIO-1-A", "BIO-1"]);

        let chain = api.chain_of_custody(&LotId::from("DIST-1"))?;
        assert_eq!(chain.first().map(|entry| entry.action), Some(CustodyAction::Intake));
        assert_eq!(chain.last().map(|entry| entry.action), Some(CustodyAction::Tested));
        assert!(api.mass_balance(&LotId::from("BIO-1"))?.balanced);
        assert_eq!(api.lab_tests_of(&LotId::from("DIST-1"))?.len(), 1);
        assert_eq!(api.inventory_report()?.lots.len(), 1);
        assert!(api.integrity_check()?.ledger_ok);

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn api_errors_carry_domain_kinds() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = TraceabilityApi::new(db_path.clone());
        api.intake(&intake("A", 5.0, "Biomass"))?;

        let Err(duplicate) = api.intake(&intake("A", 1.0, "Biomass")) else {
            return Err(anyhow::anyhow!("expected duplicate intake to fail"));
        };
        assert_eq!(trace_error(&duplicate).map(TraceError::kind), Some("duplicate_id"));

        let Err(missing) = api.history_of(&LotId::from("nope")) else {
            return Err(anyhow::anyhow!("expected unknown lot history to fail"));
        };
        assert_eq!(trace_error(&missing).map(TraceError::kind), Some("lot_not_found"));

        let Err(category) = api.intake(&intake("B", 1.0, "Gravel")) else {
            return Err(anyhow::anyhow!("expected unconfigured category to fail"));
        };
        assert_eq!(trace_error(&category).map(TraceError::kind), Some("invalid_category"));

        let permissive = TraceabilityApi::new(db_path.clone())
            .with_engine_config(EngineConfig::permissive());
        permissive.intake(&intake("B", 1.0, "Gravel"))?;
        assert_eq!(api.list_lots(&LotFilter::default())?.len(), 2);

        cleanup(&db_path);
        Ok(())
    }

    fn ship(lot_id: &str, quantity: f64) -> ShipCommand {
        ShipCommand {
            lot_id: LotId::from(lot_id),
            quantity,
            recipient: "Harbor Wellness".to_string(),
            address: None,
            carrier: None,
            tracking_number: None,
            notes: None,
            occurred_at: None,
        }
    }

    #[test]
    fn separate_handles_see_each_others_commits() -> Result<()> {
        let db_path = unique_temp_db_path();
        let front = TraceabilityApi::new(db_path.clone());
        let back = TraceabilityApi::new(db_path.clone());

        front.intake(&intake("A", 10.0, "Flower"))?;
        assert!((back.get_lot(&LotId::from("A"))?.quantity - 10.0).abs() < f64::EPSILON);

        front.ship(&ship("A", 4.0))?;
        assert!((back.get_lot(&LotId::from("A"))?.quantity - 6.0).abs() < f64::EPSILON);

        back.ship(&ship("A", 6.0))?;
        let Err(overdraw) = front.ship(&ship("A", 1.0)) else {
            return Err(anyhow::anyhow!("expected shipment from a depleted lot to fail"));
        };
        assert_eq!(trace_error(&overdraw).map(TraceError::kind), Some("insufficient_quantity"));
        assert_eq!(front.history_of(&LotId::from("A"))?.len(), 3);

        let shared = front.clone();
        shared.intake(&intake("B", 2.0, "Flower"))?;
        assert_eq!(front.list_lots(&LotFilter::default())?.len(), 2);

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn concurrent_handles_commit_every_write() -> Result<()> {
        let db_path = unique_temp_db_path();
        TraceabilityApi::new(db_path.clone()).intake(&intake("SHARED", 12.0, "Flower"))?;

        let mut handles = Vec::new();
        for worker in 0..8 {
            let api = TraceabilityApi::new(db_path.clone());
            handles.push(std::thread::spawn(move || -> Result<usize> {
                api.intake(&intake(&format!("L{worker}"), 1.0, "Flower"))?;
                let mut shipped = 0;
                for _ in 0..3 {
                    match api.ship(&ship("SHARED", 1.0)) {
                        Ok(_) => shipped += 1,
                        Err(err) if trace_error(&err).map(TraceError::kind)
                            == Some("insufficient_quantity") => {}
                        Err(err) => return Err(err),
                    }
                }
                Ok(shipped)
            }));
        }

        let mut shipped = 0;
        for handle in handles {
            let Ok(outcome) = handle.join() else {
                return Err(anyhow::anyhow!("writer thread panicked"));
            };
            shipped += outcome?;
        }

        assert_eq!(shipped, 12);
        let api = TraceabilityApi::new(db_path.clone());
        assert_eq!(api.list_lots(&LotFilter::default())?.len(), 9);
        assert!(api.get_lot(&LotId::from("SHARED"))?.quantity.abs() < f64::EPSILON);
        assert!(api.integrity_check()?.ledger_ok);

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn api_migrate_dry_run_reports_pending_versions() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = TraceabilityApi::new(db_path.clone());

        let planned = api.migrate(true)?;
        assert_eq!(planned.would_apply_versions, vec![1]);
        assert_eq!(planned.after_version, None);

        let applied = api.migrate(false)?;
        assert_eq!(applied.after_version, Some(1));
        assert_eq!(applied.up_to_date, Some(true));
        assert!(api.schema_status()?.pending_versions.is_empty());

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn api_export_import_and_backup_restore() -> Result<()> {
        let source_path = unique_temp_db_path();
        let source = TraceabilityApi::new(source_path.clone());
        source.intake(&intake("A", 12.0, "Flower"))?;

        let export_dir = std::env::temp_dir().join(format!("traceability-api-export-{}", Ulid::new()));
        source.export_snapshot(&export_dir)?;
        let target_path = unique_temp_db_path();
        let target = TraceabilityApi::new(target_path.clone());
        let summary = target.import_snapshot(&export_dir)?;
        assert_eq!(summary.imported_lots, 1);
        assert_eq!(target.get_lot(&LotId::from("A"))?, source.get_lot(&LotId::from("A"))?);

        let backup_file = unique_temp_db_path();
        source.backup_database(&backup_file)?;
        let restored_path = unique_temp_db_path();
        let restored = TraceabilityApi::new(restored_path.clone());
        let status = restored.restore_database(&backup_file)?;
        assert_eq!(status.current_version, 1);
        assert_eq!(restored.list_lots(&LotFilter::default())?.len(), 1);

        let _ = std::fs::remove_dir_all(&export_dir);
        for path in [&source_path, &target_path, &backup_file, &restored_path] {
            cleanup(path);
        }
        Ok(())
    }
}
