use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use traceability_core::{
    Attributes, ChangeSet, CustodyAction, CustodyEntry, CustodyEntryId, Journal, LabTestId,
    LabTestRecord, LedgerMark, Lot, LotId, LotInput, LotOrigin, LotStatus, ProcessId, ProcessKind,
    ProcessRecord, Shipment, Snapshot, TraceError, Unit, Category, QUANTITY_EPSILON,
    SNAPSHOT_FORMAT,
};
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS lots (
  lot_id TEXT PRIMARY KEY CHECK (length(trim(lot_id)) > 0),
  position INTEGER NOT NULL UNIQUE,
  quantity REAL NOT NULL CHECK (quantity >= 0),
  original_quantity REAL NOT NULL CHECK (original_quantity >= 0),
  unit TEXT NOT NULL CHECK (length(trim(unit)) > 0),
  category TEXT NOT NULL CHECK (length(trim(category)) > 0),
  product_type TEXT,
  status TEXT NOT NULL CHECK (status IN ('active', 'depleted')),
  origin TEXT NOT NULL CHECK (origin IN ('intake', 'subdivided', 'processed')),
  parent_lot_id TEXT REFERENCES lots(lot_id),
  created_at TEXT NOT NULL,
  attributes_json TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS lot_inputs (
  lot_id TEXT NOT NULL REFERENCES lots(lot_id),
  ordinal INTEGER NOT NULL,
  input_lot_id TEXT NOT NULL REFERENCES lots(lot_id),
  quantity REAL NOT NULL CHECK (quantity > 0),
  PRIMARY KEY (lot_id, ordinal)
);

CREATE TABLE IF NOT EXISTS processes (
  process_id TEXT PRIMARY KEY,
  position INTEGER NOT NULL UNIQUE,
  kind TEXT NOT NULL CHECK (kind IN ('intake', 'subdivide', 'snowcap', 'blend', 'convert', 'ship')),
  occurred_at TEXT NOT NULL,
  notes TEXT,
  shipment_json TEXT
);

CREATE TABLE IF NOT EXISTS process_inputs (
  process_id TEXT NOT NULL REFERENCES processes(process_id),
  ordinal INTEGER NOT NULL,
  lot_id TEXT NOT NULL REFERENCES lots(lot_id),
  quantity REAL NOT NULL CHECK (quantity > 0),
  PRIMARY KEY (process_id, ordinal)
);

CREATE TABLE IF NOT EXISTS process_outputs (
  process_id TEXT NOT NULL REFERENCES processes(process_id),
  ordinal INTEGER NOT NULL,
  lot_id TEXT NOT NULL REFERENCES lots(lot_id),
  PRIMARY KEY (process_id, ordinal)
);

CREATE TABLE IF NOT EXISTS custody_entries (
  sequence INTEGER PRIMARY KEY CHECK (sequence > 0),
  entry_id TEXT NOT NULL UNIQUE,
  lot_id TEXT NOT NULL REFERENCES lots(lot_id),
  action TEXT NOT NULL CHECK (action IN ('intake', 'subdivided', 'used', 'processed', 'shipped', 'tested')),
  description TEXT NOT NULL,
  occurred_at TEXT NOT NULL,
  process_id TEXT REFERENCES processes(process_id)
);

CREATE TABLE IF NOT EXISTS lab_tests (
  test_id TEXT PRIMARY KEY,
  position INTEGER NOT NULL UNIQUE,
  lot_id TEXT NOT NULL REFERENCES lots(lot_id),
  test_type TEXT NOT NULL,
  lab_name TEXT NOT NULL,
  certificate_number TEXT,
  passed INTEGER NOT NULL CHECK (passed IN (0, 1)),
  results_json TEXT NOT NULL DEFAULT '{}',
  notes TEXT,
  tested_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_lots_parent ON lots(parent_lot_id);
CREATE INDEX IF NOT EXISTS idx_lot_inputs_input ON lot_inputs(input_lot_id);
CREATE INDEX IF NOT EXISTS idx_process_inputs_lot ON process_inputs(lot_id);
CREATE INDEX IF NOT EXISTS idx_custody_entries_lot ON custody_entries(lot_id, sequence);
CREATE INDEX IF NOT EXISTS idx_lab_tests_lot ON lab_tests(lot_id);
";

const LOTS_FILE: &str = "lots.ndjson";
const PROCESSES_FILE: &str = "processes.ndjson";
const CUSTODY_FILE: &str = "custody.ndjson";
const LAB_TESTS_FILE: &str = "lab_tests.ndjson";
const EXPORT_FILES: [&str; 4] = [LOTS_FILE, PROCESSES_FILE, CUSTODY_FILE, LAB_TESTS_FILE];

/// SQLite persistence for the lot ledger. Doubles as the engine's [`Journal`].
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub snapshot_format: String,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported_lots: usize,
    pub imported_processes: usize,
    pub imported_custody_entries: usize,
    pub imported_lab_tests: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub ledger_ok: bool,
    pub ledger_message: String,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed ledger and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn bootstrap_schema_version(&mut self) -> Result<i64> {
        if table_exists(&self.conn, "lots")? {
            if !table_has_column(&self.conn, "lots", "position")? {
                return Err(anyhow!("database schema is invalid: lots has no position column"));
            }
            // Tables exist but the migration was never recorded.
            record_schema_version(&self.conn, 1)?;
            return Ok(1);
        }

        let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
        tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
        record_schema_version(&tx, 1)?;
        tx.commit().context("failed to commit migration v1")?;
        tracing::info!(version = 1, "applied ledger schema migration");
        Ok(1)
    }

    /// `true` when the ledger holds no lots and no custody history.
    ///
    /// # Errors
    /// Returns an error when the tables cannot be read.
    pub fn is_empty(&self) -> Result<bool> {
        ledger_is_empty(&self.conn)
    }

    /// Highest persisted custody sequence, `0` for an empty ledger.
    ///
    /// # Errors
    /// Returns an error when the custody table cannot be read.
    pub fn custody_high_water(&self) -> Result<u64> {
        custody_high_water(&self.conn)
    }

    /// Read the whole ledger as one consistent snapshot.
    ///
    /// # Errors
    /// Returns an error when a read fails or a stored value cannot be decoded.
    pub fn load_snapshot(&self) -> Result<Snapshot> {
        if !self.conn.is_autocommit() {
            // Already inside `write_locked`, which gives a consistent view.
            return read_snapshot(&self.conn);
        }
        let tx = self.conn.unchecked_transaction().context("failed to start read transaction")?;
        let snapshot = read_snapshot(&tx)?;
        tx.commit().context("failed to finish read transaction")?;
        Ok(snapshot)
    }

    /// Newest persisted custody entry, compared against [`CustodyLog::mark`] to tell whether a
    /// cached ledger is still current.
    ///
    /// [`CustodyLog::mark`]: traceability_core::CustodyLog::mark
    ///
    /// # Errors
    /// Returns an error when the custody table cannot be read.
    pub fn ledger_mark(&self) -> Result<LedgerMark> {
        let newest = self
            .conn
            .query_row(
                "SELECT sequence, entry_id FROM custody_entries ORDER BY sequence DESC LIMIT 1",
                [],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .context("failed to read newest custody entry")?;
        let Some((sequence, entry_id)) = newest else {
            return Ok(LedgerMark::default());
        };
        Ok(LedgerMark {
            high_water: u64::try_from(sequence)
                .with_context(|| format!("invalid custody sequence {sequence}"))?,
            last_entry: Some(CustodyEntryId(parse_ulid(&entry_id)?)),
        })
    }

    /// Run `run` while holding the database write lock.
    ///
    /// Other writers, in this process or another, wait on `busy_timeout` until `run` returns.
    /// Loads and commits made inside `run` join the same transaction, so state read there
    /// cannot go stale before it is written. The transaction commits when `run` succeeds and
    /// rolls back otherwise.
    ///
    /// # Errors
    /// Returns the error from `run`, or an error when the lock cannot be acquired or the
    /// commit fails.
    pub fn write_locked<T>(&mut self, run: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .context("failed to acquire ledger write lock")?;
        match run(self) {
            Ok(value) => {
                if let Err(err) = self.conn.execute_batch("COMMIT") {
                    self.rollback();
                    return Err(err).context("failed to commit ledger write");
                }
                Ok(value)
            }
            Err(err) => {
                self.rollback();
                Err(err)
            }
        }
    }

    fn rollback(&self) {
        if self.conn.is_autocommit() {
            return;
        }
        if let Err(err) = self.conn.execute_batch("ROLLBACK") {
            tracing::warn!(error = %err, "failed to roll back ledger write");
        }
    }

    /// Persist one planned engine transaction atomically.
    ///
    /// # Errors
    /// Returns an error when another writer advanced the ledger since `change` was planned,
    /// when a consumption no longer fits, or when any write fails. Nothing is written then.
    pub fn write_change(&mut self, change: &ChangeSet) -> Result<()> {
        if self.conn.is_autocommit() {
            let tx = self
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context("failed to start ledger transaction")?;
            apply_change(&tx, change)?;
            tx.commit().context("failed to commit ledger transaction")
        } else {
            let savepoint = self.conn.savepoint().context("failed to start ledger savepoint")?;
            apply_change(&savepoint, change)?;
            savepoint.commit().context("failed to release ledger savepoint")
        }
    }

    /// Export the ledger as deterministic NDJSON plus manifest.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or serialized.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let snapshot = self.load_snapshot()?;
        let digests = [
            (LOTS_FILE, write_ndjson_file(&out_dir.join(LOTS_FILE), &snapshot.lots)?),
            (PROCESSES_FILE, write_ndjson_file(&out_dir.join(PROCESSES_FILE), &snapshot.processes)?),
            (CUSTODY_FILE, write_ndjson_file(&out_dir.join(CUSTODY_FILE), &snapshot.custody)?),
            (LAB_TESTS_FILE, write_ndjson_file(&out_dir.join(LAB_TESTS_FILE), &snapshot.lab_tests)?),
        ];

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            snapshot_format: SNAPSHOT_FORMAT.to_string(),
            exported_at: now_rfc3339()?,
            files: digests
                .into_iter()
                .map(|(path, (sha256, records))| ExportFileDigest {
                    path: path.to_string(),
                    sha256,
                    records,
                })
                .collect(),
        };

        let manifest_path = out_dir.join("manifest.json");
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        tracing::info!(out_dir = %out_dir.display(), lots = snapshot.lots.len(), "exported ledger");
        Ok(manifest)
    }

    /// Import an exported snapshot directory into this (empty) database.
    ///
    /// # Errors
    /// Returns an error when the manifest does not match the files, the snapshot violates a
    /// ledger invariant, the target already holds data, or a write fails.
    pub fn import_snapshot(&mut self, in_dir: &Path) -> Result<ImportSummary> {
        self.migrate()?;
        let manifest = read_export_manifest(&in_dir.join("manifest.json"))?;
        validate_import_manifest(in_dir, &manifest)?;

        let snapshot = Snapshot {
            format: manifest.snapshot_format.clone(),
            lots: read_ndjson_file(&in_dir.join(LOTS_FILE))?,
            processes: read_ndjson_file(&in_dir.join(PROCESSES_FILE))?,
            custody: read_ndjson_file(&in_dir.join(CUSTODY_FILE))?,
            lab_tests: read_ndjson_file(&in_dir.join(LAB_TESTS_FILE))?,
        };
        snapshot.verify()?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start import transaction")?;
        if !ledger_is_empty(&tx)? {
            return Err(anyhow!("import target already holds ledger data; import into an empty database"));
        }
        for lot in &snapshot.lots {
            insert_lot(&tx, lot)?;
        }
        for process in &snapshot.processes {
            insert_process(&tx, process)?;
        }
        for entry in &snapshot.custody {
            insert_custody(&tx, entry)?;
        }
        for test in &snapshot.lab_tests {
            insert_lab_test(&tx, test)?;
        }
        tx.commit().context("failed to commit import transaction")?;

        Ok(ImportSummary {
            imported_lots: snapshot.lots.len(),
            imported_processes: snapshot.processes.len(),
            imported_custody_entries: snapshot.custody.len(),
            imported_lab_tests: snapshot.lab_tests.len(),
        })
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()?;
        Ok(())
    }

    /// Run quick-check, foreign-key-check, ledger verification and schema status probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let (ledger_ok, ledger_message) = match self.load_snapshot()?.verify() {
            Ok(()) => (true, "ok".to_string()),
            Err(err) => (false, err.to_string()),
        };

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            ledger_ok,
            ledger_message,
            schema_status,
        })
    }
}

impl Journal for SqliteStore {
    fn commit(&mut self, change: &ChangeSet) -> Result<(), TraceError> {
        self.write_change(change).map_err(|err| TraceError::Storage(format!("{err:#}")))
    }
}

fn apply_change(conn: &Connection, change: &ChangeSet) -> Result<()> {
    let high_water = custody_high_water(conn)?;
    if high_water != change.base_sequence {
        return Err(anyhow!(
            "ledger changed since load: planned against custody sequence {}, found {high_water}",
            change.base_sequence
        ));
    }

    for consumption in &change.consumed {
        let updated = conn
            .execute(
                "UPDATE lots SET
                    quantity = CASE WHEN quantity - ?2 < ?3 THEN 0.0 ELSE quantity - ?2 END,
                    status = CASE WHEN quantity - ?2 < ?3 THEN 'depleted' ELSE 'active' END
                 WHERE lot_id = ?1 AND quantity + ?3 >= ?2",
                params![consumption.lot_id.as_str(), consumption.quantity, QUANTITY_EPSILON],
            )
            .with_context(|| format!("failed to consume from lot {}", consumption.lot_id))?;
        if updated != 1 {
            return Err(anyhow!(
                "lot {} no longer holds {}",
                consumption.lot_id,
                consumption.quantity
            ));
        }
    }

    for lot in &change.created {
        insert_lot(conn, lot)?;
    }
    if let Some(process) = &change.process {
        insert_process(conn, process)?;
    }
    for entry in &change.custody {
        insert_custody(conn, entry)?;
    }
    if let Some(test) = &change.lab_test {
        insert_lab_test(conn, test)?;
    }

    Ok(())
}

fn read_snapshot(conn: &Connection) -> Result<Snapshot> {
    Ok(Snapshot {
        format: SNAPSHOT_FORMAT.to_string(),
        lots: load_lots(conn)?,
        processes: load_processes(conn)?,
        custody: load_custody(conn)?,
        lab_tests: load_lab_tests(conn)?,
    })
}

fn insert_lot(tx: &Connection, lot: &Lot) -> Result<()> {
    let attributes_json =
        serde_json::to_string(&lot.attributes).context("failed to serialize lot attributes")?;
    tx.execute(
        "INSERT INTO lots(
            lot_id, position, quantity, original_quantity, unit, category, product_type,
            status, origin, parent_lot_id, created_at, attributes_json
        ) VALUES (
            ?1, (SELECT COALESCE(MAX(position), 0) + 1 FROM lots), ?2, ?3, ?4, ?5, ?6,
            ?7, ?8, ?9, ?10, ?11
        )",
        params![
            lot.id.as_str(),
            lot.quantity,
            lot.original_quantity,
            lot.unit.as_str(),
            lot.category.as_str(),
            lot.product_type,
            lot.status.as_str(),
            lot.origin.as_str(),
            lot.parent_lot_id.as_ref().map(LotId::as_str),
            rfc3339(lot.created_at)?,
            attributes_json,
        ],
    )
    .with_context(|| format!("failed to insert lot {}", lot.id))?;

    for (ordinal, input) in lot.inputs.iter().enumerate() {
        tx.execute(
            "INSERT INTO lot_inputs(lot_id, ordinal, input_lot_id, quantity) VALUES (?1, ?2, ?3, ?4)",
            params![lot.id.as_str(), ordinal_value(ordinal)?, input.lot_id.as_str(), input.quantity],
        )
        .with_context(|| format!("failed to insert input {} of lot {}", input.lot_id, lot.id))?;
    }
    Ok(())
}

fn insert_process(tx: &Connection, process: &ProcessRecord) -> Result<()> {
    let shipment_json = process
        .shipment
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .context("failed to serialize shipment")?;
    tx.execute(
        "INSERT INTO processes(process_id, position, kind, occurred_at, notes, shipment_json)
         VALUES (?1, (SELECT COALESCE(MAX(position), 0) + 1 FROM processes), ?2, ?3, ?4, ?5)",
        params![
            process.process_id.to_string(),
            process.kind.as_str(),
            rfc3339(process.timestamp)?,
            process.notes,
            shipment_json,
        ],
    )
    .with_context(|| format!("failed to insert process {}", process.process_id))?;

    for (ordinal, input) in process.inputs.iter().enumerate() {
        tx.execute(
            "INSERT INTO process_inputs(process_id, ordinal, lot_id, quantity) VALUES (?1, ?2, ?3, ?4)",
            params![
                process.process_id.to_string(),
                ordinal_value(ordinal)?,
                input.lot_id.as_str(),
                input.quantity
            ],
        )
        .context("failed to insert process input")?;
    }
    for (ordinal, output) in process.outputs.iter().enumerate() {
        tx.execute(
            "INSERT INTO process_outputs(process_id, ordinal, lot_id) VALUES (?1, ?2, ?3)",
            params![process.process_id.to_string(), ordinal_value(ordinal)?, output.as_str()],
        )
        .context("failed to insert process output")?;
    }
    Ok(())
}

fn insert_custody(tx: &Connection, entry: &CustodyEntry) -> Result<()> {
    let sequence = i64::try_from(entry.sequence).context("custody sequence out of range")?;
    tx.execute(
        "INSERT INTO custody_entries(sequence, entry_id, lot_id, action, description, occurred_at, process_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            sequence,
            entry.entry_id.to_string(),
            entry.lot_id.as_str(),
            entry.action.as_str(),
            entry.description,
            rfc3339(entry.timestamp)?,
            entry.process_id.map(|id| id.to_string()),
        ],
    )
    .with_context(|| format!("failed to insert custody entry {}", entry.sequence))?;
    Ok(())
}

fn insert_lab_test(tx: &Connection, test: &LabTestRecord) -> Result<()> {
    let results_json =
        serde_json::to_string(&test.results).context("failed to serialize lab results")?;
    tx.execute(
        "INSERT INTO lab_tests(
            test_id, position, lot_id, test_type, lab_name, certificate_number, passed,
            results_json, notes, tested_at
        ) VALUES (
            ?1, (SELECT COALESCE(MAX(position), 0) + 1 FROM lab_tests), ?2, ?3, ?4, ?5, ?6,
            ?7, ?8, ?9
        )",
        params![
            test.test_id.to_string(),
            test.lot_id.as_str(),
            test.test_type,
            test.lab_name,
            test.certificate_number,
            test.passed,
            results_json,
            test.notes,
            rfc3339(test.tested_at)?,
        ],
    )
    .with_context(|| format!("failed to insert lab test {}", test.test_id))?;
    Ok(())
}

type LotRow = (
    String,
    f64,
    f64,
    String,
    String,
    Option<String>,
    String,
    String,
    Option<String>,
    String,
    String,
);

fn load_lots(conn: &Connection) -> Result<Vec<Lot>> {
    let mut inputs: BTreeMap<String, Vec<LotInput>> = BTreeMap::new();
    {
        let mut stmt = conn.prepare(
            "SELECT lot_id, input_lot_id, quantity FROM lot_inputs ORDER BY lot_id ASC, ordinal ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, f64>(2)?))
        })?;
        for row in rows {
            let (lot_id, input_lot_id, quantity) = row?;
            inputs
                .entry(lot_id)
                .or_default()
                .push(LotInput { lot_id: LotId::from(input_lot_id.as_str()), quantity });
        }
    }

    let mut stmt = conn.prepare(
        "SELECT lot_id, quantity, original_quantity, unit, category, product_type,
                status, origin, parent_lot_id, created_at, attributes_json
         FROM lots
         ORDER BY position ASC",
    )?;
    let rows = stmt.query_map([], |row| -> rusqlite::Result<LotRow> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
            row.get(7)?,
            row.get(8)?,
            row.get(9)?,
            row.get(10)?,
        ))
    })?;

    let mut lots = Vec::new();
    for row in rows {
        let (
            lot_id,
            quantity,
            original_quantity,
            unit,
            category,
            product_type,
            status,
            origin,
            parent_lot_id,
            created_at,
            attributes_json,
        ) = row?;
        let status = LotStatus::parse(&status)
            .ok_or_else(|| anyhow!("invalid status {status:?} for lot {lot_id}"))?;
        let origin = LotOrigin::parse(&origin)
            .ok_or_else(|| anyhow!("invalid origin {origin:?} for lot {lot_id}"))?;
        let attributes = serde_json::from_str::<Attributes>(&attributes_json)
            .with_context(|| format!("invalid attributes for lot {lot_id}"))?;
        lots.push(Lot {
            id: LotId::from(lot_id.as_str()),
            quantity,
            original_quantity,
            unit: Unit::parse(&unit)?,
            category: Category::parse(&category)?,
            product_type,
            status,
            origin,
            parent_lot_id: parent_lot_id.as_deref().map(LotId::from),
            inputs: inputs.remove(&lot_id).unwrap_or_default(),
            created_at: parse_rfc3339(&created_at)?,
            attributes,
        });
    }
    Ok(lots)
}

fn load_processes(conn: &Connection) -> Result<Vec<ProcessRecord>> {
    let mut inputs: BTreeMap<String, Vec<LotInput>> = BTreeMap::new();
    {
        let mut stmt = conn.prepare(
            "SELECT process_id, lot_id, quantity FROM process_inputs
             ORDER BY process_id ASC, ordinal ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, f64>(2)?))
        })?;
        for row in rows {
            let (process_id, lot_id, quantity) = row?;
            inputs
                .entry(process_id)
                .or_default()
                .push(LotInput { lot_id: LotId::from(lot_id.as_str()), quantity });
        }
    }
    let mut outputs: BTreeMap<String, Vec<LotId>> = BTreeMap::new();
    {
        let mut stmt = conn.prepare(
            "SELECT process_id, lot_id FROM process_outputs ORDER BY process_id ASC, ordinal ASC",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        for row in rows {
            let (process_id, lot_id) = row?;
            outputs.entry(process_id).or_default().push(LotId::from(lot_id.as_str()));
        }
    }

    let mut stmt = conn.prepare(
        "SELECT process_id, kind, occurred_at, notes, shipment_json
         FROM processes
         ORDER BY position ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, Option<String>>(4)?,
        ))
    })?;

    let mut processes = Vec::new();
    for row in rows {
        let (process_id, kind, occurred_at, notes, shipment_json) = row?;
        let kind = ProcessKind::parse(&kind)
            .ok_or_else(|| anyhow!("invalid kind {kind:?} for process {process_id}"))?;
        let shipment = shipment_json
            .map(|raw| serde_json::from_str::<Shipment>(&raw))
            .transpose()
            .with_context(|| format!("invalid shipment for process {process_id}"))?;
        processes.push(ProcessRecord {
            process_id: ProcessId(parse_ulid(&process_id)?),
            kind,
            inputs: inputs.remove(&process_id).unwrap_or_default(),
            outputs: outputs.remove(&process_id).unwrap_or_default(),
            timestamp: parse_rfc3339(&occurred_at)?,
            notes,
            shipment,
        });
    }
    Ok(processes)
}

fn load_custody(conn: &Connection) -> Result<Vec<CustodyEntry>> {
    let mut stmt = conn.prepare(
        "SELECT sequence, entry_id, lot_id, action, description, occurred_at, process_id
         FROM custody_entries
         ORDER BY sequence ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, String>(5)?,
            row.get::<_, Option<String>>(6)?,
        ))
    })?;

    let mut entries = Vec::new();
    for row in rows {
        let (sequence, entry_id, lot_id, action, description, occurred_at, process_id) = row?;
        let action = CustodyAction::parse(&action)
            .ok_or_else(|| anyhow!("invalid custody action {action:?} at sequence {sequence}"))?;
        entries.push(CustodyEntry {
            entry_id: CustodyEntryId(parse_ulid(&entry_id)?),
            sequence: u64::try_from(sequence)
                .with_context(|| format!("invalid custody sequence {sequence}"))?,
            lot_id: LotId::from(lot_id.as_str()),
            action,
            description,
            timestamp: parse_rfc3339(&occurred_at)?,
            process_id: process_id.as_deref().map(parse_ulid).transpose()?.map(ProcessId),
        });
    }
    Ok(entries)
}

fn load_lab_tests(conn: &Connection) -> Result<Vec<LabTestRecord>> {
    let mut stmt = conn.prepare(
        "SELECT test_id, lot_id, test_type, lab_name, certificate_number, passed,
                results_json, notes, tested_at
         FROM lab_tests
         ORDER BY position ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, Option<String>>(4)?,
            row.get::<_, bool>(5)?,
            row.get::<_, String>(6)?,
            row.get::<_, Option<String>>(7)?,
            row.get::<_, String>(8)?,
        ))
    })?;

    let mut tests = Vec::new();
    for row in rows {
        let (
            test_id,
            lot_id,
            test_type,
            lab_name,
            certificate_number,
            passed,
            results_json,
            notes,
            tested_at,
        ) = row?;
        tests.push(LabTestRecord {
            results: serde_json::from_str(&results_json)
                .with_context(|| format!("invalid results for lab test {test_id}"))?,
            test_id: LabTestId(parse_ulid(&test_id)?),
            lot_id: LotId::from(lot_id.as_str()),
            test_type,
            lab_name,
            certificate_number,
            passed,
            notes,
            tested_at: parse_rfc3339(&tested_at)?,
        });
    }
    Ok(tests)
}

fn ledger_is_empty(conn: &Connection) -> Result<bool> {
    let rows = conn
        .query_row(
            "SELECT (SELECT COUNT(*) FROM lots) + (SELECT COUNT(*) FROM custody_entries)",
            [],
            |row| row.get::<_, i64>(0),
        )
        .context("failed to count ledger rows")?;
    Ok(rows == 0)
}

fn custody_high_water(conn: &Connection) -> Result<u64> {
    let sequence = conn
        .query_row("SELECT COALESCE(MAX(sequence), 0) FROM custody_entries", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read custody high-water mark")?;
    u64::try_from(sequence).with_context(|| format!("invalid custody sequence {sequence}"))
}

fn ordinal_value(ordinal: usize) -> Result<i64> {
    i64::try_from(ordinal).context("ordinal out of range")
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }
    if table_has_column(conn, "lots", "position")? {
        return Ok((1, true));
    }
    Ok((0, false))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn parse_ulid(raw: &str) -> Result<Ulid> {
    Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        writer
            .write_all(b"\n")
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok((format!("{:x}", hasher.finalize()), values.len()))
}

fn read_ndjson_file<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut values = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = serde_json::from_str(trimmed).with_context(|| {
            format!("failed to parse NDJSON row {} from {}", index + 1, path.display())
        })?;
        values.push(value);
    }

    Ok(values)
}

fn read_export_manifest(path: &Path) -> Result<ExportManifest> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read manifest file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse manifest JSON {}", path.display()))
}

fn ndjson_digest_and_records(path: &Path) -> Result<(String, usize)> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut records = 0_usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
        if !line.trim().is_empty() {
            records += 1;
        }
    }

    Ok((format!("{:x}", hasher.finalize()), records))
}

fn validate_import_manifest(in_dir: &Path, manifest: &ExportManifest) -> Result<()> {
    if manifest.schema_version <= 0 || manifest.schema_version > LATEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported export schema version {}; supported range is 1..={}",
            manifest.schema_version,
            LATEST_SCHEMA_VERSION
        ));
    }
    if manifest.snapshot_format != SNAPSHOT_FORMAT {
        return Err(anyhow!("unsupported snapshot format {:?}", manifest.snapshot_format));
    }

    let mut by_path: BTreeMap<&str, &ExportFileDigest> = BTreeMap::new();
    for file in &manifest.files {
        if by_path.insert(file.path.as_str(), file).is_some() {
            return Err(anyhow!("manifest contains duplicate file entry: {}", file.path));
        }
    }

    for required in EXPORT_FILES {
        let Some(expected) = by_path.get(required) else {
            return Err(anyhow!("manifest is missing required file entry: {required}"));
        };
        let file_path = in_dir.join(required);
        if !file_path.exists() {
            return Err(anyhow!("manifest references missing file {}", file_path.display()));
        }

        let (actual_sha256, actual_records) = ndjson_digest_and_records(&file_path)?;
        if actual_sha256 != expected.sha256 {
            return Err(anyhow!(
                "manifest digest mismatch for {required}: expected {}, got {}",
                expected.sha256,
                actual_sha256
            ));
        }
        if actual_records != expected.records {
            return Err(anyhow!(
                "manifest record count mismatch for {required}: expected {}, got {}",
                expected.records,
                actual_records
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::thread;

    use super::*;
    use traceability_core::{
        ChildSpec, EngineConfig, IntakeCommand, LabTestCommand, OutputSpec,
        ProcessCommand, ProcessEngine, Receipt, ShipCommand, SubdivideCommand, TransformKind,
    };

    fn intake(lot_id: &str, quantity: f64) -> IntakeCommand {
        IntakeCommand {
            lot_id: LotId::from(lot_id),
            quantity,
            unit: "lbs".to_string(),
            category: "Plant Material".to_string(),
            product_type: Some("flower".to_string()),
            vendor: Some("Green Acres".to_string()),
            attributes: Attributes::from([("invoice".to_string(), "INV-204".to_string())]),
            notes: None,
            occurred_at: None,
        }
    }

    fn ship(lot_id: &str, quantity: f64) -> ShipCommand {
        ShipCommand {
            lot_id: LotId::from(lot_id),
            quantity,
            recipient: "Acme Dispensary".to_string(),
            address: Some("12 Main St".to_string()),
            carrier: Some("UPS".to_string()),
            tracking_number: Some("1Z999".to_string()),
            notes: None,
            occurred_at: None,
        }
    }

    fn open_engine(path: &Path) -> Result<ProcessEngine<SqliteStore>> {
        let mut store = SqliteStore::open(path)?;
        store.migrate()?;
        let snapshot = store.load_snapshot()?;
        Ok(ProcessEngine::from_snapshot(EngineConfig::default(), snapshot, store)?)
    }

    /// Reload and ship under the write lock, the way the API serializes writers.
    fn ship_locked(store: &mut SqliteStore, command: &ShipCommand) -> Result<Receipt> {
        store.write_locked(|store| {
            let snapshot = store.load_snapshot()?;
            let engine = ProcessEngine::from_snapshot(EngineConfig::default(), snapshot, store)?;
            Ok(engine.ship(command)?)
        })
    }

    fn memory_engine() -> Result<ProcessEngine<SqliteStore>> {
        open_engine(Path::new(":memory:"))
    }

    fn temp_path(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("traceability-{label}-{}", Ulid::new()))
    }

    fn cleanup_db(path: &Path) -> Result<()> {
        for suffix in ["", "-wal", "-shm"] {
            let candidate = PathBuf::from(format!("{}{suffix}", path.display()));
            if candidate.exists() {
                fs::remove_file(&candidate).with_context(|| {
                    format!("failed to cleanup sqlite file {}", candidate.display())
                })?;
            }
        }
        Ok(())
    }

    /// A small ledger touching every table: intake, subdivide, blend, ship, lab test.
    fn populate(engine: &ProcessEngine<impl Journal>) -> Result<()> {
        engine.intake(&intake("A", 100.0))?;
        engine.intake(&intake("B", 10.0))?;
        engine.subdivide(&SubdivideCommand {
            parent_lot_id: LotId::from("A"),
            children: vec![
                ChildSpec { lot_id: LotId::from("A1"), quantity: 40.0 },
                ChildSpec { lot_id: LotId::from("A2"), quantity: 60.0 },
            ],
            notes: Some("split for processing".to_string()),
            occurred_at: None,
        })?;
        engine.process(&ProcessCommand {
            kind: TransformKind::Snowcap,
            inputs: vec![
                LotInput { lot_id: LotId::from("A1"), quantity: 40.0 },
                LotInput { lot_id: LotId::from("B"), quantity: 10.0 },
            ],
            output: OutputSpec {
                lot_id: LotId::from("C1"),
                quantity: 50.0,
                unit: "lbs".to_string(),
                category: "Concentrates".to_string(),
                product_type: Some("vape".to_string()),
                attributes: Attributes::new(),
            },
            notes: None,
            occurred_at: None,
        })?;
        engine.ship(&ship("C1", 20.0))?;
        engine.record_lab_test(&LabTestCommand {
            lot_id: LotId::from("A2"),
            test_type: "potency".to_string(),
            lab_name: "Evio Labs".to_string(),
            certificate_number: Some("COA-1".to_string()),
            passed: true,
            results: BTreeMap::from([("thc_total".to_string(), "0.19%".to_string())]),
            notes: None,
            occurred_at: None,
        })?;
        Ok(())
    }

    #[test]
    fn sqlite_constraints_enforce_checks_and_foreign_keys() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;

        let negative = store.conn.execute(
            "INSERT INTO lots(lot_id, position, quantity, original_quantity, unit, category,
                              status, origin, created_at)
             VALUES ('X', 1, -1.0, 5.0, 'lbs', 'Biomass', 'active', 'intake', '2026-01-01T00:00:00Z')",
            [],
        );
        assert!(negative.is_err());

        let bad_status = store.conn.execute(
            "INSERT INTO lots(lot_id, position, quantity, original_quantity, unit, category,
                              status, origin, created_at)
             VALUES ('X', 1, 1.0, 5.0, 'lbs', 'Biomass', 'archived', 'intake', '2026-01-01T00:00:00Z')",
            [],
        );
        assert!(bad_status.is_err());

        let orphan = store.conn.execute(
            "INSERT INTO lots(lot_id, position, quantity, original_quantity, unit, category,
                              status, origin, parent_lot_id, created_at)
             VALUES ('X1', 1, 1.0, 1.0, 'lbs', 'Biomass', 'active', 'subdivided', 'ghost',
                     '2026-01-01T00:00:00Z')",
            [],
        );
        assert!(orphan.is_err());
        Ok(())
    }

    #[test]
    fn committed_transactions_reload_identically() -> Result<()> {
        let path = temp_path("reload").with_extension("sqlite3");
        let exported = {
            let engine = open_engine(&path)?;
            populate(&engine)?;
            engine.export_all()
        };

        let reloaded = open_engine(&path)?;
        assert_eq!(reloaded.export_all(), exported);
        let c1 = reloaded.get_lot(&LotId::from("C1"))?;
        assert!((c1.quantity - 30.0).abs() < f64::EPSILON);
        assert_eq!(c1.inputs.len(), 2);
        assert_eq!(reloaded.descendants_of(&LotId::from("A"))?.len(), 3);
        assert_eq!(reloaded.lab_tests_of(&LotId::from("A2"))?.len(), 1);

        drop(reloaded);
        cleanup_db(&path)
    }

    #[test]
    fn rejected_commands_write_nothing() -> Result<()> {
        let path = temp_path("rejected").with_extension("sqlite3");
        {
            let engine = open_engine(&path)?;
            engine.intake(&intake("A", 5.0))?;
            assert!(engine.ship(&ship("A", 50.0)).is_err());
            assert!(engine.intake(&intake("A", 1.0)).is_err());
        }

        let store = SqliteStore::open(&path)?;
        let snapshot = store.load_snapshot()?;
        assert_eq!(snapshot.lots.len(), 1);
        assert!((snapshot.lots[0].quantity - 5.0).abs() < f64::EPSILON);
        assert_eq!(store.custody_high_water()?, 1);
        assert!(snapshot.processes.iter().all(|process| process.kind == ProcessKind::Intake));

        drop(store);
        cleanup_db(&path)
    }

    #[test]
    fn unlocked_commit_against_stale_plan_is_rejected() -> Result<()> {
        let path = temp_path("stale").with_extension("sqlite3");
        {
            let engine = open_engine(&path)?;
            engine.intake(&intake("A", 10.0))?;
        }

        let first = open_engine(&path)?;
        let second = open_engine(&path)?;
        first.ship(&ship("A", 2.0))?;

        let err = second.ship(&ship("A", 2.0)).err();
        assert!(matches!(
            &err,
            Some(TraceError::Storage(message)) if message.contains("ledger changed since load")
        ));
        assert!((second.get_lot(&LotId::from("A"))?.quantity - 10.0).abs() < f64::EPSILON);

        drop((first, second));
        cleanup_db(&path)
    }

    #[test]
    fn locked_writer_plans_against_competing_shipment() -> Result<()> {
        let path = temp_path("locked").with_extension("sqlite3");
        {
            let engine = open_engine(&path)?;
            engine.intake(&intake("A", 10.0))?;
        }

        let mut first = SqliteStore::open(&path)?;
        let mut second = SqliteStore::open(&path)?;
        ship_locked(&mut first, &ship("A", 6.0))?;

        let Err(err) = ship_locked(&mut second, &ship("A", 6.0)) else {
            return Err(anyhow!("second shipment of 6 from 10 should not fit"));
        };
        assert!(matches!(
            err.downcast_ref::<TraceError>(),
            Some(TraceError::InsufficientQuantity { requested, available, .. })
                if (*requested - 6.0).abs() < f64::EPSILON && (*available - 4.0).abs() < f64::EPSILON
        ));
        assert!(second.conn.is_autocommit());

        ship_locked(&mut second, &ship("A", 4.0))?;
        let snapshot = first.load_snapshot()?;
        snapshot.verify()?;
        assert!(snapshot.lots[0].quantity.abs() < f64::EPSILON);
        assert_eq!(snapshot.lots[0].status, LotStatus::Depleted);
        assert_eq!(first.ledger_mark()?.high_water, 3);

        drop((first, second));
        cleanup_db(&path)
    }

    #[test]
    fn write_locked_rolls_back_failed_runs() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        assert_eq!(store.ledger_mark()?, LedgerMark::default());

        let failed: Result<()> = store.write_locked(|store| {
            let snapshot = store.load_snapshot()?;
            let engine = ProcessEngine::from_snapshot(EngineConfig::default(), snapshot, store)?;
            engine.intake(&intake("A", 10.0))?;
            Err(anyhow!("abandon"))
        });
        assert!(failed.is_err());
        assert!(store.is_empty()?);

        let receipt = store.write_locked(|store| {
            let snapshot = store.load_snapshot()?;
            let engine = ProcessEngine::from_snapshot(EngineConfig::default(), snapshot, store)?;
            let receipt = engine.intake(&intake("A", 10.0))?;
            assert_eq!(engine.read(|inventory| inventory.custody().mark()).high_water, 1);
            Ok(receipt)
        })?;
        assert_eq!(receipt.created, vec![LotId::from("A")]);

        let mark = store.ledger_mark()?;
        let loaded = traceability_core::Inventory::load(store.load_snapshot()?)?;
        assert_eq!(mark, loaded.custody().mark());
        assert!(mark.last_entry.is_some());
        Ok(())
    }

    #[test]
    fn export_and_import_snapshot_round_trip() -> Result<()> {
        let path = temp_path("export-source").with_extension("sqlite3");
        let exported = {
            let engine = open_engine(&path)?;
            populate(&engine)?;
            engine.export_all()
        };

        let export_dir = temp_path("export");
        let manifest = SqliteStore::open(&path)?.export_snapshot(&export_dir)?;
        assert_eq!(manifest.files.len(), 4);
        assert_eq!(manifest.snapshot_format, SNAPSHOT_FORMAT);
        let lot_file = manifest.files.iter().find(|file| file.path == LOTS_FILE);
        assert_eq!(lot_file.map(|file| file.records), Some(6));

        let mut target = SqliteStore::open(Path::new(":memory:"))?;
        let summary = target.import_snapshot(&export_dir)?;
        assert_eq!(summary.imported_lots, 6);
        assert_eq!(summary.imported_processes, 5);
        assert_eq!(summary.imported_lab_tests, 1);
        assert_eq!(target.load_snapshot()?, exported);

        let Err(err) = target.import_snapshot(&export_dir) else {
            return Err(anyhow!("expected import into a populated ledger to fail"));
        };
        assert!(err.to_string().contains("already holds ledger data"));

        fs::remove_dir_all(&export_dir).with_context(|| {
            format!("failed to cleanup temp export dir {}", export_dir.display())
        })?;
        cleanup_db(&path)
    }

    #[test]
    fn import_rejects_manifest_digest_mismatch() -> Result<()> {
        use std::io::Write as _;

        let mut source = SqliteStore::open(Path::new(":memory:"))?;
        source.migrate()?;
        let export_dir = temp_path("tampered");
        source.export_snapshot(&export_dir)?;

        let lots_path = export_dir.join(LOTS_FILE);
        let mut tampered = std::fs::OpenOptions::new().append(true).open(&lots_path)?;
        writeln!(tampered, "{{\"tampered\":true}}")?;

        let mut target = SqliteStore::open(Path::new(":memory:"))?;
        let Err(err) = target.import_snapshot(&export_dir) else {
            return Err(anyhow!("expected import failure for mismatched manifest digest"));
        };
        assert!(err.to_string().contains("manifest digest mismatch for lots.ndjson"));

        fs::remove_dir_all(&export_dir).with_context(|| {
            format!("failed to cleanup temp export dir {}", export_dir.display())
        })?;
        Ok(())
    }

    #[test]
    fn import_rejects_snapshot_that_breaks_conservation() -> Result<()> {
        let source = memory_engine()?;
        populate(&source)?;
        let mut snapshot = source.export_all();
        if let Some(lot) = snapshot.lots.iter_mut().find(|lot| lot.id.as_str() == "A2") {
            lot.quantity = 12.0;
        }

        let export_dir = temp_path("corrupt");
        fs::create_dir_all(&export_dir)?;
        let files = [
            (LOTS_FILE, write_ndjson_file(&export_dir.join(LOTS_FILE), &snapshot.lots)?),
            (PROCESSES_FILE, write_ndjson_file(&export_dir.join(PROCESSES_FILE), &snapshot.processes)?),
            (CUSTODY_FILE, write_ndjson_file(&export_dir.join(CUSTODY_FILE), &snapshot.custody)?),
            (LAB_TESTS_FILE, write_ndjson_file(&export_dir.join(LAB_TESTS_FILE), &snapshot.lab_tests)?),
        ];
        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            snapshot_format: SNAPSHOT_FORMAT.to_string(),
            exported_at: now_rfc3339()?,
            files: files
                .into_iter()
                .map(|(path, (sha256, records))| ExportFileDigest {
                    path: path.to_string(),
                    sha256,
                    records,
                })
                .collect(),
        };
        fs::write(export_dir.join("manifest.json"), serde_json::to_vec_pretty(&manifest)?)?;

        let mut target = SqliteStore::open(Path::new(":memory:"))?;
        let Err(err) = target.import_snapshot(&export_dir) else {
            return Err(anyhow!("expected corrupt snapshot to be rejected"));
        };
        assert!(matches!(
            err.downcast_ref::<TraceError>(),
            Some(TraceError::CorruptSnapshot(_))
        ));
        assert!(target.is_empty()?);

        fs::remove_dir_all(&export_dir)?;
        Ok(())
    }

    #[test]
    fn backup_and_restore_database_round_trip() -> Result<()> {
        let path = temp_path("backup-source").with_extension("sqlite3");
        let exported = {
            let engine = open_engine(&path)?;
            populate(&engine)?;
            engine.export_all()
        };

        let backup_file = temp_path("backup").with_extension("sqlite3");
        SqliteStore::open(&path)?.backup_database(&backup_file)?;

        let mut target = SqliteStore::open(Path::new(":memory:"))?;
        target.restore_database(&backup_file)?;
        assert_eq!(target.load_snapshot()?, exported);

        fs::remove_file(&backup_file).with_context(|| {
            format!("failed to cleanup temp backup file {}", backup_file.display())
        })?;
        cleanup_db(&path)
    }

    #[test]
    fn integrity_check_reports_clean_and_corrupt_ledgers() -> Result<()> {
        let path = temp_path("integrity").with_extension("sqlite3");
        {
            let engine = open_engine(&path)?;
            engine.intake(&intake("A", 10.0))?;
        }

        let store = SqliteStore::open(&path)?;
        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());
        assert!(report.ledger_ok);
        assert_eq!(report.schema_status.current_version, 1);
        assert!(report.schema_status.pending_versions.is_empty());

        store.conn.execute("UPDATE lots SET quantity = 3.0 WHERE lot_id = 'A'", [])?;
        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(!report.ledger_ok);
        assert!(report.ledger_message.contains("corrupt snapshot"));

        drop(store);
        cleanup_db(&path)
    }

    #[test]
    fn schema_status_reports_pending_migration_before_migrate() -> Result<()> {
        let store = SqliteStore::open(Path::new(":memory:"))?;
        let status = store.schema_status()?;
        assert_eq!(status.current_version, 0);
        assert_eq!(status.pending_versions, vec![1]);
        Ok(())
    }

    #[test]
    fn concurrent_shippers_never_overdraw_a_lot() -> Result<()> {
        let path = temp_path("concurrency").with_extension("sqlite3");
        {
            let engine = open_engine(&path)?;
            engine.intake(&intake("A", 25.0))?;
        }

        let threads = 4;
        let attempts_per_thread = 10;
        let mut handles = Vec::new();
        for _ in 0..threads {
            let thread_path = path.clone();
            handles.push(thread::spawn(move || -> Result<(usize, usize)> {
                let mut store = SqliteStore::open(&thread_path)?;
                let (mut shipped, mut refused) = (0, 0);
                for _ in 0..attempts_per_thread {
                    match ship_locked(&mut store, &ship("A", 1.0)) {
                        Ok(_) => shipped += 1,
                        Err(err)
                            if matches!(
                                err.downcast_ref::<TraceError>(),
                                Some(TraceError::InsufficientQuantity { .. })
                            ) =>
                        {
                            refused += 1;
                        }
                        Err(err) => return Err(err),
                    }
                }
                Ok((shipped, refused))
            }));
        }

        let (mut shipped, mut refused) = (0, 0);
        for handle in handles {
            let Ok(thread_result) = handle.join() else {
                return Err(anyhow!("concurrency thread panicked"));
            };
            let (thread_shipped, thread_refused) = thread_result?;
            shipped += thread_shipped;
            refused += thread_refused;
        }

        assert_eq!(shipped, 25);
        assert_eq!(refused, threads * attempts_per_thread - 25);
        let store = SqliteStore::open(&path)?;
        let snapshot = store.load_snapshot()?;
        snapshot.verify()?;
        assert!(snapshot.lots[0].quantity.abs() < f64::EPSILON);
        assert_eq!(snapshot.custody.len(), 26);

        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());
        drop(store);
        cleanup_db(&path)
    }
}
