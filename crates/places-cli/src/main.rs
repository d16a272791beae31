use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use places_core::{Category, Place};
use places_store_sqlite::export_files::{
    default_export_dir, delete_exported_file, exported_file_exists, exported_file_info,
    read_export_document,
};
use places_store_sqlite::{inspect_schema, ExportTarget, MigrationOptions, PlaceStore};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "places")]
#[command(about = "Places catalog CLI")]
struct Cli {
    #[arg(long, env = "PLACES_DB", default_value = "./places.sqlite3")]
    db: PathBuf,

    /// Directory for export files; defaults to the user's downloads directory.
    #[arg(long, env = "PLACES_EXPORT_DIR")]
    export_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Place {
        #[command(subcommand)]
        command: Box<PlaceCommand>,
    },
    Export(ExportArgs),
    Import(ImportArgs),
    ExportFile {
        #[command(subcommand)]
        command: ExportFileCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
    /// Seed for backfilled ratings, for reproducible upgrades.
    #[arg(long)]
    backfill_seed: Option<u64>,
    #[arg(long, default_value_t = false)]
    no_backfill: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Subcommand)]
enum PlaceCommand {
    Add(PlaceAddArgs),
    List(PlaceListArgs),
    Show(PlaceIdArgs),
    Update(PlaceUpdateArgs),
    Delete(PlaceIdArgs),
    Favorite(PlaceFavoriteArgs),
}

#[derive(Debug, Args)]
struct PlaceAddArgs {
    #[arg(long)]
    name: String,
    #[arg(long, allow_hyphen_values = true)]
    latitude: f64,
    #[arg(long, allow_hyphen_values = true)]
    longitude: f64,
    #[arg(long, value_enum)]
    category: CategoryArg,
    #[arg(long, default_value = "")]
    description: String,
    #[arg(long, default_value_t = 0.0)]
    rating: f64,
    #[arg(long, default_value_t = false)]
    favorite: bool,
    #[arg(long, default_value = "")]
    cuisine_type: String,
}

#[derive(Debug, Args)]
struct PlaceListArgs {
    #[arg(long, value_enum)]
    category: Option<CategoryArg>,
    #[arg(long, default_value_t = false)]
    favorites: bool,
}

#[derive(Debug, Args)]
struct PlaceIdArgs {
    #[arg(long)]
    id: i64,
}

#[derive(Debug, Args)]
struct PlaceUpdateArgs {
    #[arg(long)]
    id: i64,
    #[arg(long)]
    name: Option<String>,
    #[arg(long, allow_hyphen_values = true)]
    latitude: Option<f64>,
    #[arg(long, allow_hyphen_values = true)]
    longitude: Option<f64>,
    #[arg(long, value_enum)]
    category: Option<CategoryArg>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    rating: Option<f64>,
    #[arg(long)]
    favorite: Option<bool>,
    #[arg(long)]
    cuisine_type: Option<String>,
    /// Epoch milliseconds; written through as given.
    #[arg(long)]
    created_at: Option<i64>,
}

#[derive(Debug, Args)]
struct PlaceFavoriteArgs {
    #[arg(long)]
    id: i64,
    #[arg(long, action = clap::ArgAction::Set)]
    value: bool,
}

#[derive(Debug, Args)]
struct ExportArgs {
    /// Write the well-known `places_export.json` instead of a timestamped file.
    #[arg(long, default_value_t = false)]
    latest: bool,
}

#[derive(Debug, Args)]
struct ImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum ExportFileCommand {
    Exists,
    Info,
    Delete,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CategoryArg {
    Restaurant,
    Cafe,
    Bar,
    Bakery,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    init_tracing();
    let Cli { db, export_dir, command } = Cli::parse();
    let export_dir = export_dir.unwrap_or_else(default_export_dir);

    match command {
        Command::Db { command } => run_db(&command, &db),
        Command::Place { command } => {
            let store = PlaceStore::open(&db)?;
            run_place(*command, &store)
        }
        Command::Export(args) => {
            let store = PlaceStore::open(&db)?;
            run_export(&args, &store, &export_dir)
        }
        Command::Import(args) => {
            let store = PlaceStore::open(&db)?;
            run_import(&args, &store)
        }
        Command::ExportFile { command } => run_export_file(&command, &export_dir),
    }
}

fn run_db(command: &DbCommand, db: &Path) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(db),
        DbCommand::Migrate(args) => run_db_migrate(args, db),
        DbCommand::Backup(args) => run_db_backup(args, &PlaceStore::open(db)?),
        DbCommand::IntegrityCheck => run_db_integrity_check(&PlaceStore::open(db)?),
    }
}

fn run_db_schema_version(db: &Path) -> Result<()> {
    let status = inspect_schema(db)?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty(),
        "inferred_from_legacy": status.inferred_from_legacy
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, db: &Path) -> Result<()> {
    if args.dry_run {
        let before = inspect_schema(db)?;
        emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions,
            "inferred_from_legacy": before.inferred_from_legacy
        }))?;
        return Ok(());
    }

    let options = MigrationOptions { backfill: !args.no_backfill, backfill_seed: args.backfill_seed };
    let (_store, report) = PlaceStore::open_with(db, &options)?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": report.from_version,
        "applied_versions": report.applied.iter().map(|step| step.to).collect::<Vec<_>>(),
        "after_version": report.to_version,
        "inferred_from_legacy": report.inferred_from_legacy,
        "backfill": report.backfill,
        "up_to_date": true
    }))
}

fn run_db_backup(args: &DbBackupArgs, store: &PlaceStore) -> Result<()> {
    store.backup_database(&args.out)?;
    emit_json(serde_json::json!({
        "backup_path": args.out,
        "status": "ok"
    }))
}

fn run_db_integrity_check(store: &PlaceStore) -> Result<()> {
    let report = store.integrity_check()?;
    emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
}

fn run_place(command: PlaceCommand, store: &PlaceStore) -> Result<()> {
    match command {
        PlaceCommand::Add(args) => run_place_add(args, store),
        PlaceCommand::List(args) => run_place_list(&args, store),
        PlaceCommand::Show(args) => run_place_show(&args, store),
        PlaceCommand::Update(args) => run_place_update(args, store),
        PlaceCommand::Delete(args) => {
            let affected = store.delete(args.id)?;
            emit_json(serde_json::json!({ "id": args.id, "affected": affected }))
        }
        PlaceCommand::Favorite(args) => {
            let affected = store.set_favorite(args.id, args.value)?;
            emit_json(serde_json::json!({
                "id": args.id,
                "is_favorite": args.value,
                "affected": affected
            }))
        }
    }
}

fn run_place_add(args: PlaceAddArgs, store: &PlaceStore) -> Result<()> {
    let place = Place::new(args.name, args.latitude, args.longitude, args.category.into_category())
        .with_description(args.description)
        .with_rating(args.rating)
        .with_favorite(args.favorite)
        .with_cuisine_type(args.cuisine_type);
    place.validate()?;

    let id = store.insert(&place)?;
    let stored = store
        .get_by_id(id)?
        .ok_or_else(|| anyhow!("place {id} missing immediately after insert"))?;
    emit_json(serde_json::json!({ "id": id, "place": stored }))
}

fn run_place_list(args: &PlaceListArgs, store: &PlaceStore) -> Result<()> {
    let places = match (args.category, args.favorites) {
        (Some(category), favorites) => store
            .get_by_category(category.into_category())?
            .into_iter()
            .filter(|place| !favorites || place.is_favorite)
            .collect(),
        (None, true) => store.get_favorites()?,
        (None, false) => store.get_all()?,
    };

    emit_json(serde_json::json!({
        "count": places.len(),
        "places": places
    }))
}

fn run_place_show(args: &PlaceIdArgs, store: &PlaceStore) -> Result<()> {
    let place = store.get_by_id(args.id)?;
    emit_json(serde_json::json!({
        "id": args.id,
        "found": place.is_some(),
        "place": place,
        "appearance": place.as_ref().map(|place| place.category.appearance())
    }))
}

fn run_place_update(args: PlaceUpdateArgs, store: &PlaceStore) -> Result<()> {
    let Some(mut place) = store.get_by_id(args.id)? else {
        return emit_json(serde_json::json!({ "id": args.id, "affected": 0 }));
    };

    if let Some(name) = args.name {
        place.name = name;
    }
    if let Some(latitude) = args.latitude {
        place.latitude = latitude;
    }
    if let Some(longitude) = args.longitude {
        place.longitude = longitude;
    }
    if let Some(category) = args.category {
        place.category = category.into_category();
    }
    if let Some(description) = args.description {
        place.description = description;
    }
    if let Some(rating) = args.rating {
        place.rating = rating;
    }
    if let Some(is_favorite) = args.favorite {
        place.is_favorite = is_favorite;
    }
    if let Some(cuisine_type) = args.cuisine_type {
        place.cuisine_type = cuisine_type;
    }
    if let Some(created_at) = args.created_at {
        place.created_at = created_at;
    }
    place.validate()?;

    let affected = store.update(&place)?;
    emit_json(serde_json::json!({ "id": args.id, "affected": affected, "place": place }))
}

fn run_export(args: &ExportArgs, store: &PlaceStore, export_dir: &Path) -> Result<()> {
    let target = if args.latest { ExportTarget::Latest } else { ExportTarget::Timestamped };
    let outcome = store.export_to_dir(export_dir, target)?;
    emit_json(serde_json::json!({
        "out_dir": export_dir,
        "path": outcome.path,
        "total_count": outcome.total_count
    }))
}

fn run_import(args: &ImportArgs, store: &PlaceStore) -> Result<()> {
    let document = read_export_document(&args.input)?;
    for (index, place) in document.places.iter().enumerate() {
        place.validate().with_context(|| {
            format!("import rejected: place #{index} ({:?}) is invalid", place.name)
        })?;
    }

    let summary = store.import_document(&document)?;
    emit_json(serde_json::json!({
        "in_file": args.input,
        "summary": summary
    }))
}

fn run_export_file(command: &ExportFileCommand, export_dir: &Path) -> Result<()> {
    match command {
        ExportFileCommand::Exists => emit_json(serde_json::json!({
            "out_dir": export_dir,
            "exists": exported_file_exists(export_dir)
        })),
        ExportFileCommand::Info => emit_json(serde_json::json!({
            "out_dir": export_dir,
            "info": exported_file_info(export_dir)?
        })),
        ExportFileCommand::Delete => emit_json(serde_json::json!({
            "out_dir": export_dir,
            "deleted": delete_exported_file(export_dir)?
        })),
    }
}

impl CategoryArg {
    fn into_category(self) -> Category {
        match self {
            Self::Restaurant => Category::Restaurant,
            Self::Cafe => Category::Cafe,
            Self::Bar => Category::Bar,
            Self::Bakery => Category::Bakery,
        }
    }
}
