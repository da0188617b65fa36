use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use palate_core::{
    format_score, score_from_rank, Category, Choice, ComparisonSession, ItemDetails, ItemId,
    NewItem, RankedItem, RankingEngine, ScoreTier,
};
use palate_store_sqlite::SqliteStore;
use serde_json::Value;
use time::OffsetDateTime;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "palate")]
#[command(about = "Palate pairwise ranking CLI")]
struct Cli {
    #[arg(long, global = true, default_value = "./palate.sqlite3")]
    db: PathBuf,

    /// Log at debug level (overridden by `PALATE_LOG`).
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log errors (overridden by `PALATE_LOG`).
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Item {
        #[command(subcommand)]
        command: Box<ItemCommand>,
    },
    Category {
        #[command(subcommand)]
        command: Box<CategoryCommand>,
    },
    /// Print the score the curve assigns to a rank.
    Score(ScoreArgs),
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
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    skip_existing: bool,
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
enum ItemCommand {
    /// Show which existing items a new item would be compared against.
    CompareSet(CategoryArgs),
    Add(AddArgs),
    List(CategoryArgs),
    Delete(ItemRefArgs),
    Rerank(RerankArgs),
    Update(UpdateArgs),
}

#[derive(Debug, Subcommand)]
enum CategoryCommand {
    List,
    Stats(CategoryArgs),
    Clear(CategoryArgs),
}

#[derive(Debug, Args)]
struct CategoryArgs {
    #[arg(long)]
    category: String,
}

#[derive(Debug, Args)]
struct ItemRefArgs {
    #[arg(long)]
    category: String,
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
struct RerankArgs {
    #[command(flatten)]
    item: ItemRefArgs,
    #[arg(long)]
    rank: u32,
}

#[derive(Debug, Args)]
struct AddArgs {
    #[arg(long)]
    category: String,
    #[arg(long)]
    name: String,
    #[command(flatten)]
    details: DetailsArgs,
    #[arg(long)]
    id: Option<String>,
    #[arg(long)]
    created_at: Option<String>,
    #[command(flatten)]
    placement: PlacementArgs,
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
struct PlacementArgs {
    /// Insert directly at this rank.
    #[arg(long)]
    rank: Option<u32>,
    /// Answers for the planned comparisons, in order.
    #[arg(long = "choice", value_enum)]
    choices: Vec<ChoiceArg>,
    /// Prompt for each comparison on stdin.
    #[arg(long)]
    interactive: bool,
}

#[derive(Debug, Args)]
struct UpdateArgs {
    #[command(flatten)]
    item: ItemRefArgs,
    #[arg(long)]
    name: Option<String>,
    #[command(flatten)]
    details: DetailsArgs,
}

#[derive(Debug, Args)]
struct DetailsArgs {
    #[arg(long)]
    producer: Option<String>,
    #[arg(long)]
    notes: Option<String>,
    #[arg(long = "where")]
    place: Option<String>,
    #[arg(long = "when")]
    occasion: Option<String>,
    #[arg(long = "with")]
    company: Option<String>,
    /// Extra attribute as KEY=VALUE; VALUE is parsed as JSON when possible.
    #[arg(long = "extra", value_name = "KEY=VALUE")]
    extra: Vec<String>,
}

#[derive(Debug, Args)]
struct ScoreArgs {
    #[arg(long)]
    rank: u32,
    #[arg(long)]
    total: usize,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ChoiceArg {
    New,
    Existing,
    Skip,
}

impl ChoiceArg {
    fn into_choice(self) -> Choice {
        match self {
            Self::New => Choice::PreferNew,
            Self::Existing => Choice::PreferExisting,
            Self::Skip => Choice::Skipped,
        }
    }
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

fn init_tracing(quiet: bool, verbose: bool) -> Result<()> {
    let level = if quiet {
        "error"
    } else if verbose {
        "debug"
    } else {
        "warn"
    };

    let filter = tracing_subscriber::EnvFilter::try_from_env("PALATE_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init()
        .map_err(|error| anyhow!("failed to initialize tracing subscriber: {error}"))?;

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.quiet, cli.verbose)?;

    match cli.command {
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(*command, &mut store)
        }
        Command::Item { command } => run_item(*command, open_engine(&cli.db)?),
        Command::Category { command } => run_category(*command, open_engine(&cli.db)?),
        Command::Score(args) => run_score(&args),
    }
}

fn open_engine(path: &std::path::Path) -> Result<RankingEngine<SqliteStore>> {
    let mut store = SqliteStore::open(path)?;
    store.migrate()?;
    Ok(RankingEngine::new(store))
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::Export(args) => run_db_export(&args, store),
        DbCommand::Import(args) => run_db_import(&args, store),
        DbCommand::Backup(args) => run_db_backup(&args, store),
        DbCommand::Restore(args) => run_db_restore(&args, store),
        DbCommand::IntegrityCheck => run_db_integrity_check(store),
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty()
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }));
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_db_export(args: &DbExportArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    let manifest = store.export_snapshot(&args.out)?;
    emit_json(serde_json::json!({
        "out_dir": args.out,
        "manifest": manifest
    }))
}

fn run_db_import(args: &DbImportArgs, store: &mut SqliteStore) -> Result<()> {
    let summary = store.import_snapshot(&args.input, args.skip_existing)?;
    emit_json(serde_json::json!({
        "in_dir": args.input,
        "skip_existing": args.skip_existing,
        "summary": summary
    }))
}

fn run_db_backup(args: &DbBackupArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    store.backup_database(&args.out)?;
    emit_json(serde_json::json!({
        "backup_path": args.out,
        "status": "ok"
    }))
}

fn run_db_restore(args: &DbRestoreArgs, store: &mut SqliteStore) -> Result<()> {
    store.restore_database(&args.input)?;
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "restored_from": args.input,
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions
    }))
}

fn run_db_integrity_check(store: &SqliteStore) -> Result<()> {
    let report = store.integrity_check()?;
    emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
}

fn run_item(command: ItemCommand, mut engine: RankingEngine<SqliteStore>) -> Result<()> {
    match command {
        ItemCommand::CompareSet(args) => {
            let category = parse_category(&args.category)?;
            let items = engine.items(&category)?;
            let session = ComparisonSession::begin(category.clone(), &items);
            let by_id = index_by_id(&items);
            let compare_set = session
                .planned()
                .iter()
                .filter_map(|id| by_id.get(id).copied())
                .map(item_json)
                .collect::<Result<Vec<_>>>()?;
            emit_json(serde_json::json!({
                "category": category,
                "existing_items": items.len(),
                "compare_set": compare_set
            }))
        }
        ItemCommand::Add(args) => run_item_add(args, &mut engine),
        ItemCommand::List(args) => {
            let category = parse_category(&args.category)?;
            let items =
                engine.items(&category)?.iter().map(item_json).collect::<Result<Vec<_>>>()?;
            emit_json(serde_json::json!({
                "category": category,
                "items": items
            }))
        }
        ItemCommand::Delete(args) => {
            let (category, item_id) = parse_item_ref(&args)?;
            let deleted = engine.delete(&category, &item_id)?;
            emit_json(serde_json::json!({
                "category": category,
                "item_id": item_id,
                "deleted": deleted,
                "remaining": engine.items(&category)?.len()
            }))
        }
        ItemCommand::Rerank(args) => {
            let (category, item_id) = parse_item_ref(&args.item)?;
            let item = engine.re_rank(&category, &item_id, args.rank)?;
            emit_json(serde_json::json!({ "item": item_json(&item)? }))
        }
        ItemCommand::Update(args) => {
            let (category, item_id) = parse_item_ref(&args.item)?;
            let Some(current) = engine.items(&category)?.into_iter().find(|item| item.id == item_id)
            else {
                return Err(anyhow!("item {item_id} not found in category {category}"));
            };
            let mut details = current.details;
            if let Some(name) = args.name {
                details.name = name;
            }
            apply_details(&mut details, args.details)?;
            let item = engine.update_details(&category, &item_id, details)?;
            emit_json(serde_json::json!({ "item": item_json(&item)? }))
        }
    }
}

fn run_item_add(args: AddArgs, engine: &mut RankingEngine<SqliteStore>) -> Result<()> {
    let category = parse_category(&args.category)?;
    let mut details = ItemDetails::named(&args.name);
    apply_details(&mut details, args.details)?;
    let candidate = NewItem {
        id: args.id.as_deref().map(ItemId::parse).transpose()?,
        details,
        created_at: args.created_at.as_deref().map(parse_rfc3339).transpose()?,
    };

    let placement = args.placement;
    if let Some(rank) = placement.rank {
        let item = engine.insert(&category, candidate, rank)?;
        return emit_json(serde_json::json!({
            "placement": "explicit_rank",
            "item": item_json(&item)?
        }));
    }

    let mut session = engine.begin_session(&category)?;
    if placement.interactive {
        let existing = engine.items(&category)?;
        let stdin = io::stdin();
        prompt_comparisons(&mut session, &index_by_id(&existing), &args.name, stdin.lock())?;
    } else {
        let planned = session.planned().len();
        for choice in placement.choices {
            session.record(choice.into_choice()).with_context(|| {
                format!("more choices supplied than the {planned} planned comparisons")
            })?;
        }
    }

    let tally = session.tally();
    let projected = session.projected_tally();
    let item = engine.insert_from_session(&session, candidate)?;
    emit_json(serde_json::json!({
        "placement": "comparisons",
        "planned_comparisons": session.planned().len(),
        "outcomes": session.outcomes(),
        "wins": tally.wins,
        "losses": tally.losses,
        "skipped": tally.skipped,
        "inferred_wins": projected.wins - tally.wins,
        "item": item_json(&item)?
    }))
}

/// Ask for one answer per planned comparison until the session has enough
/// signal. `q` or end of input stops early and ranks on what was answered.
fn prompt_comparisons<B: BufRead>(
    session: &mut ComparisonSession,
    existing: &BTreeMap<&ItemId, &RankedItem>,
    new_name: &str,
    input: B,
) -> Result<()> {
    let mut lines = input.lines();
    while session.needs_more_comparisons() {
        let Some(current_id) = session.current().cloned() else {
            break;
        };
        let existing_name =
            existing.get(&current_id).map_or(current_id.as_str(), |item| item.details.name.as_str());

        {
            let mut stderr = io::stderr().lock();
            write!(
                stderr,
                "Which do you prefer? [n] {new_name}  [e] {existing_name}  [s]kip  [q]uit: "
            )
            .and_then(|()| stderr.flush())
            .context("failed to write prompt")?;
        }

        let Some(line) = lines.next() else {
            tracing::debug!("stdin closed; ranking on answers so far");
            break;
        };
        let line = line.context("failed to read answer from stdin")?;
        let answer = line.trim().to_ascii_lowercase();
        let choice = match answer.as_str() {
            "n" => Choice::PreferNew,
            "e" => Choice::PreferExisting,
            "s" => Choice::Skipped,
            "q" => break,
            other => match Choice::parse(other) {
                Some(choice) => choice,
                None => {
                    tracing::warn!(answer = other, "unrecognized answer; expected n, e, s or q");
                    continue;
                }
            },
        };
        session.record(choice)?;
    }
    Ok(())
}

fn run_category(command: CategoryCommand, mut engine: RankingEngine<SqliteStore>) -> Result<()> {
    match command {
        CategoryCommand::List => {
            let mut categories = Vec::new();
            for category in engine.categories()? {
                let total_items = engine.items(&category)?.len();
                categories.push(serde_json::json!({
                    "category": category,
                    "total_items": total_items
                }));
            }
            emit_json(serde_json::json!({ "categories": categories }))
        }
        CategoryCommand::Stats(args) => {
            let category = parse_category(&args.category)?;
            let stats = engine.stats(&category)?;
            emit_json(serde_json::json!({
                "category": stats.category,
                "total_items": stats.total_items,
                "average_score": stats.average_score,
                "average_display_score": format_score(stats.average_score),
                "top_item": stats.top_item.as_ref().map(item_json).transpose()?,
                "recent_items": stats.recent_items.iter().map(item_json).collect::<Result<Vec<_>>>()?
            }))
        }
        CategoryCommand::Clear(args) => {
            let category = parse_category(&args.category)?;
            let removed = engine.clear(&category)?;
            emit_json(serde_json::json!({
                "category": category,
                "removed": removed
            }))
        }
    }
}

fn run_score(args: &ScoreArgs) -> Result<()> {
    let within_total = usize::try_from(args.rank).is_ok_and(|rank| rank <= args.total);
    if args.rank == 0 || !within_total {
        return Err(anyhow!("rank {} MUST be within 1..={}", args.rank, args.total));
    }
    let score = score_from_rank(args.rank, args.total);
    emit_json(serde_json::json!({
        "rank": args.rank,
        "total": args.total,
        "score": score,
        "display_score": format_score(score),
        "tier": ScoreTier::from_score(score).as_str()
    }))
}

fn item_json(item: &RankedItem) -> Result<Value> {
    let mut value = serde_json::to_value(item).context("failed to serialize ranked item")?;
    if let Value::Object(object) = &mut value {
        object.insert("display_score".to_string(), Value::String(format_score(item.score)));
        object.insert(
            "tier".to_string(),
            Value::String(ScoreTier::from_score(item.score).as_str().to_string()),
        );
    }
    Ok(value)
}

fn index_by_id(items: &[RankedItem]) -> BTreeMap<&ItemId, &RankedItem> {
    items.iter().map(|item| (&item.id, item)).collect()
}

fn apply_details(details: &mut ItemDetails, args: DetailsArgs) -> Result<()> {
    if args.producer.is_some() {
        details.producer = args.producer;
    }
    if args.notes.is_some() {
        details.notes = args.notes;
    }
    if args.place.is_some() {
        details.memory.place = args.place;
    }
    if args.occasion.is_some() {
        details.memory.occasion = args.occasion;
    }
    if args.company.is_some() {
        details.memory.company = args.company;
    }
    for raw in args.extra {
        let (key, value) = parse_extra(&raw)?;
        details.extra.insert(key, value);
    }
    Ok(())
}

fn parse_extra(raw: &str) -> Result<(String, Value)> {
    let Some((key, value)) = raw.split_once('=') else {
        return Err(anyhow!("extra attribute MUST be KEY=VALUE (received: {raw})"));
    };
    let key = key.trim();
    if key.is_empty() {
        return Err(anyhow!("extra attribute key MUST be non-empty (received: {raw})"));
    }
    let value =
        serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn parse_category(value: &str) -> Result<Category> {
    Category::parse(value).with_context(|| format!("invalid category: {value}"))
}

fn parse_item_ref(args: &ItemRefArgs) -> Result<(Category, ItemId)> {
    let category = parse_category(&args.category)?;
    let item_id = ItemId::parse(&args.id).with_context(|| format!("invalid item id: {}", args.id))?;
    Ok((category, item_id))
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 UTC timestamp: {value}"))?;

    if parsed.offset() != time::UtcOffset::UTC {
        return Err(anyhow!("timestamp MUST use UTC offset Z (received: {value})"));
    }

    Ok(parsed)
}
