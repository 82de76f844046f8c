use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use time::OffsetDateTime;
use traceability_api::{TraceabilityApi, TraceabilityConfig, API_CONTRACT_VERSION};
use traceability_core::{
    Attributes, Category, ChildSpec, IntakeCommand, LabTestCommand, LotFilter, LotId, LotInput,
    LotOrder, LotOrigin, LotStatus, OutputSpec, ProcessCommand, ShipCommand, SubdivideCommand,
    TransformKind,
};
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "lotctl")]
#[command(about = "Lot lineage, quantity and chain-of-custody ledger")]
struct Cli {
    /// Overrides `database` from the config file.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Config file; without it `./traceability.yaml` is used when present.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Lot {
        #[command(subcommand)]
        command: Box<LotCommand>,
    },
    Custody {
        #[command(subcommand)]
        command: Box<CustodyCommand>,
    },
    Lineage {
        #[command(subcommand)]
        command: Box<LineageCommand>,
    },
    Report {
        #[command(subcommand)]
        command: Box<ReportCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Export(DbExportArgs),
    Import(DbImportArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbExportArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum LotCommand {
    Intake(IntakeArgs),
    Subdivide(SubdivideArgs),
    Process(ProcessArgs),
    Ship(ShipArgs),
    Test(LabTestArgs),
    Show(LotIdArgs),
    List(ListArgs),
}

#[derive(Debug, Args)]
struct IntakeArgs {
    #[arg(long)]
    lot_id: String,
    #[arg(long)]
    quantity: f64,
    #[arg(long)]
    unit: String,
    #[arg(long)]
    category: String,
    #[arg(long)]
    product_type: Option<String>,
    #[arg(long)]
    vendor: Option<String>,
    /// Provenance attribute as KEY=VALUE; repeatable.
    #[arg(long = "attr")]
    attributes: Vec<String>,
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Debug, Args)]
struct SubdivideArgs {
    #[arg(long)]
    parent: String,
    /// Child lot as LOT_ID=QUANTITY; repeatable.
    #[arg(long = "child", required = true)]
    children: Vec<String>,
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Debug, Args)]
struct ProcessArgs {
    #[arg(long, value_enum)]
    kind: TransformArg,
    /// Input lot as LOT_ID=QUANTITY; repeatable.
    #[arg(long = "input", required = true)]
    inputs: Vec<String>,
    #[arg(long)]
    output_lot_id: String,
    #[arg(long)]
    output_quantity: f64,
    #[arg(long)]
    output_unit: String,
    #[arg(long)]
    output_category: String,
    #[arg(long)]
    output_product_type: Option<String>,
    #[arg(long = "attr")]
    attributes: Vec<String>,
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Debug, Args)]
struct ShipArgs {
    #[arg(long)]
    lot_id: String,
    #[arg(long)]
    quantity: f64,
    #[arg(long)]
    recipient: String,
    #[arg(long)]
    address: Option<String>,
    #[arg(long)]
    carrier: Option<String>,
    #[arg(long)]
    tracking_number: Option<String>,
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Debug, Args)]
struct LabTestArgs {
    #[arg(long)]
    lot_id: String,
    #[arg(long)]
    test_type: String,
    #[arg(long)]
    lab_name: String,
    #[arg(long)]
    certificate_number: Option<String>,
    #[arg(long, value_enum)]
    outcome: OutcomeArg,
    /// Measured value as NAME=VALUE; repeatable.
    #[arg(long = "result")]
    results: Vec<String>,
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Debug, Args)]
struct CommonArgs {
    #[arg(long)]
    notes: Option<String>,
    /// RFC 3339 timestamp; defaults to now.
    #[arg(long)]
    occurred_at: Option<String>,
}

#[derive(Debug, Args)]
struct LotIdArgs {
    #[arg(long)]
    lot_id: String,
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long)]
    category: Option<String>,
    #[arg(long, value_enum)]
    status: Option<StatusArg>,
    #[arg(long, value_enum)]
    origin: Option<OriginArg>,
    #[arg(long, value_enum, default_value = "insertion")]
    order: OrderArg,
}

#[derive(Debug, Subcommand)]
enum CustodyCommand {
    History(LotIdArgs),
    Chain(LotIdArgs),
}

#[derive(Debug, Subcommand)]
enum LineageCommand {
    Ancestors(LotIdArgs),
    Descendants(LotIdArgs),
}

#[derive(Debug, Subcommand)]
enum ReportCommand {
    Inventory,
    Custody,
    Balance(LotIdArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TransformArg {
    Snowcap,
    Blend,
    Convert,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutcomeArg {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StatusArg {
    Active,
    Depleted,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OriginArg {
    Intake,
    Subdivided,
    Processed,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OrderArg {
    Insertion,
    Id,
    CreatedAt,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            object.insert(
                "api_contract_version".to_string(),
                Value::String(API_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "api_contract_version": API_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing(config_filter: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config_filter.unwrap_or("warn")))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    // A second init (e.g. in tests) keeps the first subscriber.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = TraceabilityConfig::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.database = db;
    }
    init_tracing(config.log_filter.as_deref());
    tracing::debug!(database = %config.database.display(), "lotctl starting");

    let api = TraceabilityApi::from_config(&config);
    match cli.command {
        Command::Db { command } => run_db(*command, &api),
        Command::Lot { command } => run_lot(*command, &api),
        Command::Custody { command } => run_custody(*command, &api),
        Command::Lineage { command } => run_lineage(*command, &api),
        Command::Report { command } => run_report(*command, &api),
    }
}

fn run_db(command: DbCommand, api: &TraceabilityApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
                "inferred_from_legacy": status.inferred_from_legacy
            }))
        }
        DbCommand::Migrate(args) => emit_json(serde_json::to_value(api.migrate(args.dry_run)?)?),
        DbCommand::Export(args) => {
            let manifest = api.export_snapshot(&args.out)?;
            emit_json(serde_json::json!({
                "out_dir": args.out,
                "manifest": manifest
            }))
        }
        DbCommand::Import(args) => {
            let summary = api.import_snapshot(&args.input)?;
            emit_json(serde_json::json!({
                "in_dir": args.input,
                "summary": summary
            }))
        }
        DbCommand::Backup(args) => {
            api.backup_database(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::Restore(args) => {
            let status = api.restore_database(&args.input)?;
            emit_json(serde_json::json!({
                "restored_from": args.input,
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions
            }))
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
        }
    }
}

fn run_lot(command: LotCommand, api: &TraceabilityApi) -> Result<()> {
    match command {
        LotCommand::Intake(args) => {
            let receipt = api.intake(&IntakeCommand {
                lot_id: LotId::parse(&args.lot_id)?,
                quantity: args.quantity,
                unit: args.unit,
                category: args.category,
                product_type: args.product_type,
                vendor: args.vendor,
                attributes: parse_text_pairs("attr", &args.attributes)?,
                notes: args.common.notes,
                occurred_at: parse_occurred_at(args.common.occurred_at.as_deref())?,
            })?;
            emit_json(serde_json::json!({ "receipt": receipt }))
        }
        LotCommand::Subdivide(args) => {
            let children = parse_quantity_pairs("child", &args.children)?
                .into_iter()
                .map(|(lot_id, quantity)| ChildSpec { lot_id, quantity })
                .collect();
            let receipt = api.subdivide(&SubdivideCommand {
                parent_lot_id: LotId::parse(&args.parent)?,
                children,
                notes: args.common.notes,
                occurred_at: parse_occurred_at(args.common.occurred_at.as_deref())?,
            })?;
            emit_json(serde_json::json!({ "receipt": receipt }))
        }
        LotCommand::Process(args) => {
            let inputs = parse_quantity_pairs("input", &args.inputs)?
                .into_iter()
                .map(|(lot_id, quantity)| LotInput { lot_id, quantity })
                .collect();
            let receipt = api.process(&ProcessCommand {
                kind: match args.kind {
                    TransformArg::Snowcap => TransformKind::Snowcap,
                    TransformArg::Blend => TransformKind::Blend,
                    TransformArg::Convert => TransformKind::Convert,
                },
                inputs,
                output: OutputSpec {
                    lot_id: LotId::parse(&args.output_lot_id)?,
                    quantity: args.output_quantity,
                    unit: args.output_unit,
                    category: args.output_category,
                    product_type: args.output_product_type,
                    attributes: parse_text_pairs("attr", &args.attributes)?,
                },
                notes: args.common.notes,
                occurred_at: parse_occurred_at(args.common.occurred_at.as_deref())?,
            })?;
            emit_json(serde_json::json!({ "receipt": receipt }))
        }
        LotCommand::Ship(args) => {
            let receipt = api.ship(&ShipCommand {
                lot_id: LotId::parse(&args.lot_id)?,
                quantity: args.quantity,
                recipient: args.recipient,
                address: args.address,
                carrier: args.carrier,
                tracking_number: args.tracking_number,
                notes: args.common.notes,
                occurred_at: parse_occurred_at(args.common.occurred_at.as_deref())?,
            })?;
            emit_json(serde_json::json!({ "receipt": receipt }))
        }
        LotCommand::Test(args) => {
            let record = api.record_lab_test(&LabTestCommand {
                lot_id: LotId::parse(&args.lot_id)?,
                test_type: args.test_type,
                lab_name: args.lab_name,
                certificate_number: args.certificate_number,
                passed: matches!(args.outcome, OutcomeArg::Pass),
                results: parse_text_pairs("result", &args.results)?,
                notes: args.common.notes,
                occurred_at: parse_occurred_at(args.common.occurred_at.as_deref())?,
            })?;
            emit_json(serde_json::json!({ "lab_test": record }))
        }
        LotCommand::Show(args) => {
            let lot_id = LotId::parse(&args.lot_id)?;
            let lot = api.get_lot(&lot_id)?;
            let lab_tests = api.lab_tests_of(&lot_id)?;
            emit_json(serde_json::json!({ "lot": lot, "lab_tests": lab_tests }))
        }
        LotCommand::List(args) => {
            let filter = LotFilter {
                category: args.category.as_deref().map(Category::parse).transpose()?,
                status: args.status.map(|status| match status {
                    StatusArg::Active => LotStatus::Active,
                    StatusArg::Depleted => LotStatus::Depleted,
                }),
                origin: args.origin.map(|origin| match origin {
                    OriginArg::Intake => LotOrigin::Intake,
                    OriginArg::Subdivided => LotOrigin::Subdivided,
                    OriginArg::Processed => LotOrigin::Processed,
                }),
                order: match args.order {
                    OrderArg::Insertion => LotOrder::Insertion,
                    OrderArg::Id => LotOrder::Id,
                    OrderArg::CreatedAt => LotOrder::CreatedAt,
                },
            };
            let lots = api.list_lots(&filter)?;
            emit_json(serde_json::json!({ "count": lots.len(), "lots": lots }))
        }
    }
}

fn run_custody(command: CustodyCommand, api: &TraceabilityApi) -> Result<()> {
    let (lot_id, entries) = match command {
        CustodyCommand::History(args) => {
            let lot_id = LotId::parse(&args.lot_id)?;
            let entries = api.history_of(&lot_id)?;
            (lot_id, entries)
        }
        CustodyCommand::Chain(args) => {
            let lot_id = LotId::parse(&args.lot_id)?;
            let entries = api.chain_of_custody(&lot_id)?;
            (lot_id, entries)
        }
    };
    emit_json(serde_json::json!({ "lot_id": lot_id, "entries": entries }))
}

fn run_lineage(command: LineageCommand, api: &TraceabilityApi) -> Result<()> {
    let (direction, lot_id, lots) = match command {
        LineageCommand::Ancestors(args) => {
            let lot_id = LotId::parse(&args.lot_id)?;
            let lots = api.ancestors_of(&lot_id)?;
            ("ancestors", lot_id, lots)
        }
        LineageCommand::Descendants(args) => {
            let lot_id = LotId::parse(&args.lot_id)?;
            let lots = api.descendants_of(&lot_id)?;
            ("descendants", lot_id, lots)
        }
    };
    emit_json(serde_json::json!({
        "lot_id": lot_id,
        "direction": direction,
        "lots": lots
    }))
}

fn run_report(command: ReportCommand, api: &TraceabilityApi) -> Result<()> {
    match command {
        ReportCommand::Inventory => emit_json(serde_json::to_value(api.inventory_report()?)?),
        ReportCommand::Custody => emit_json(serde_json::to_value(api.custody_report()?)?),
        ReportCommand::Balance(args) => {
            emit_json(serde_json::to_value(api.mass_balance(&LotId::parse(&args.lot_id)?)?)?)
        }
    }
}

fn parse_occurred_at(raw: Option<&str>) -> Result<Option<OffsetDateTime>> {
    raw.map(|value| {
        OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
            .with_context(|| format!("invalid --occurred-at RFC3339 timestamp: {value}"))
    })
    .transpose()
}

fn split_pair<'a>(flag: &str, raw: &'a str) -> Result<(&'a str, &'a str)> {
    let Some((key, value)) = raw.split_once('=') else {
        return Err(anyhow!("--{flag} expects KEY=VALUE, got {raw:?}"));
    };
    if key.trim().is_empty() {
        return Err(anyhow!("--{flag} has an empty key: {raw:?}"));
    }
    Ok((key.trim(), value.trim()))
}

fn parse_text_pairs(flag: &str, raw: &[String]) -> Result<Attributes> {
    let mut pairs = BTreeMap::new();
    for entry in raw {
        let (key, value) = split_pair(flag, entry)?;
        pairs.insert(key.to_string(), value.to_string());
    }
    Ok(pairs)
}

fn parse_quantity_pairs(flag: &str, raw: &[String]) -> Result<Vec<(LotId, f64)>> {
    raw.iter()
        .map(|entry| {
            let (lot_id, quantity) = split_pair(flag, entry)?;
            let quantity = quantity
                .parse::<f64>()
                .with_context(|| format!("--{flag} has a non-numeric quantity: {entry:?}"))?;
            Ok((LotId::parse(lot_id)?, quantity))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantity_pairs_parse_and_trim() -> Result<()> {
        let pairs = parse_quantity_pairs("child", &[" A1 = 40.5".to_string(), "A2=0.25".to_string()])?;
        assert_eq!(pairs, vec![(LotId::from("A1"), 40.5), (LotId::from("A2"), 0.25)]);
        Ok(())
    }

    #[test]
    fn malformed_pairs_are_rejected() {
        assert!(parse_quantity_pairs("child", &["A1".to_string()]).is_err());
        assert!(parse_quantity_pairs("child", &["A1=lots".to_string()]).is_err());
        assert!(parse_text_pairs("attr", &["=value".to_string()]).is_err());
    }

    #[test]
    fn occurred_at_requires_rfc3339() -> Result<()> {
        assert!(parse_occurred_at(Some("2026-03-01T12:00:00Z"))?.is_some());
        assert!(parse_occurred_at(None)?.is_none());
        assert!(parse_occurred_at(Some("yesterday")).is_err());
        Ok(())
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
