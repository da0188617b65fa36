use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use palate_core::{
    check_contiguity, recalculate_scores, Category, ItemDetails, ItemId, ItemRepository,
    KernelError, RankedItem,
};
use rusqlite::{params, Connection, DatabaseName, Transaction};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;
const ITEMS_FILE: &str = "ranked_items.ndjson";
const MANIFEST_FILE: &str = "manifest.json";

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS ranked_items (
  category TEXT NOT NULL,
  item_id TEXT NOT NULL,
  rank INTEGER NOT NULL CHECK (rank >= 1),
  score REAL NOT NULL CHECK (score >= 0.0 AND score <= 10.0),
  created_at TEXT NOT NULL,
  updated_at TEXT,
  details_json TEXT NOT NULL,
  PRIMARY KEY (category, item_id),
  UNIQUE (category, rank)
);

CREATE INDEX IF NOT EXISTS idx_ranked_items_category_rank ON ranked_items(category, rank);
CREATE INDEX IF NOT EXISTS idx_ranked_items_created_at ON ranked_items(created_at);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
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
    pub exported_at: String,
    pub categories: Vec<Category>,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ImportSummary {
    pub imported_items: usize,
    pub skipped_existing_items: usize,
    pub touched_categories: Vec<Category>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RankViolation {
    pub category: Category,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub rank_violations: Vec<RankViolation>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed item store and configure required runtime pragmas.
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
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected at most {LATEST_SCHEMA_VERSION}"
            ));
        }

        if version < 1 {
            let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
            tracing::debug!(version = 1, "applied schema migration");
        }

        Ok(())
    }

    /// Load one category's items ordered by ascending rank.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded from `SQLite`.
    pub fn load_category(&self, category: &Category) -> Result<Vec<RankedItem>> {
        load_category_rows(&self.conn, category)
    }

    /// Load every stored item ordered by category, then rank.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded from `SQLite`.
    pub fn list_items(&self) -> Result<Vec<RankedItem>> {
        let mut stmt = self.conn.prepare(
            "SELECT category, item_id, rank, score, created_at, updated_at, details_json
             FROM ranked_items
             ORDER BY category ASC, rank ASC, created_at ASC, item_id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            items.push(decode_item(row)?);
        }
        Ok(items)
    }

    /// # Errors
    /// Returns an error when the category names cannot be read or parsed.
    pub fn list_categories(&self) -> Result<Vec<Category>> {
        let mut stmt =
            self.conn.prepare("SELECT DISTINCT category FROM ranked_items ORDER BY category ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut categories = Vec::new();
        for row in rows {
            let raw = row?;
            categories.push(
                Category::parse(&raw).with_context(|| format!("invalid stored category: {raw}"))?,
            );
        }
        Ok(categories)
    }

    /// Atomically replace one category's collection.
    ///
    /// # Errors
    /// Returns an error when an item belongs to another category or any write
    /// in the transaction fails. Nothing is written on error.
    pub fn replace_category(&mut self, category: &Category, items: &[RankedItem]) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        replace_category_rows(&tx, category, items)?;
        tx.commit().context("failed to commit category replace")?;

        tracing::debug!(category = %category, items = items.len(), "replaced category collection");
        Ok(())
    }

    /// Export every item as deterministic NDJSON plus a digest manifest.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or serialized.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let items = self.list_items()?;
        let items_path = out_dir.join(ITEMS_FILE);
        let (sha256, records) = write_ndjson_file(&items_path, &items)?;

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            exported_at: now_rfc3339()?,
            categories: self.list_categories()?,
            files: vec![ExportFileDigest { path: ITEMS_FILE.to_string(), sha256, records }],
        };

        let manifest_path = out_dir.join(MANIFEST_FILE);
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        tracing::info!(out_dir = %out_dir.display(), records, "exported snapshot");
        Ok(manifest)
    }

    /// Import an exported snapshot directory, merging into existing
    /// categories. Each touched category is rebuilt so ranks stay contiguous,
    /// and the whole merge commits as one transaction.
    ///
    /// # Errors
    /// Returns an error when the manifest does not match the files, a row
    /// carries an invalid category, id or name, an id collides and
    /// `skip_existing` is false, or any write fails. Nothing is written on error.
    pub fn import_snapshot(&mut self, in_dir: &Path, skip_existing: bool) -> Result<ImportSummary> {
        self.migrate()?;
        let manifest = read_export_manifest(&in_dir.join(MANIFEST_FILE))?;
        validate_import_manifest(in_dir, &manifest)?;

        let mut incoming: BTreeMap<Category, Vec<RankedItem>> = BTreeMap::new();
        for item in read_ndjson_file::<RankedItem>(&in_dir.join(ITEMS_FILE))? {
            item.details
                .validate()
                .with_context(|| format!("imported item {} is invalid", item.id))?;
            incoming.entry(item.category.clone()).or_default().push(item);
        }

        let tx = self.conn.transaction().context("failed to start import transaction")?;
        let mut summary = ImportSummary::default();
        for (category, items) in incoming {
            let mut merged = load_category_rows(&tx, &category)?;
            let mut known = merged.iter().map(|item| item.id.clone()).collect::<BTreeSet<_>>();

            for item in items {
                if known.contains(&item.id) {
                    if skip_existing {
                        summary.skipped_existing_items += 1;
                        continue;
                    }
                    return Err(anyhow!(
                        "item {} already exists in category {category}",
                        item.id
                    ));
                }
                known.insert(item.id.clone());
                merged.push(item);
                summary.imported_items += 1;
            }

            replace_category_rows(&tx, &category, &recalculate_scores(merged))?;
            summary.touched_categories.push(category);
        }
        tx.commit().context("failed to commit snapshot import")?;

        tracing::info!(
            in_dir = %in_dir.display(),
            imported = summary.imported_items,
            skipped = summary.skipped_existing_items,
            "imported snapshot"
        );
        Ok(summary)
    }

    /// Copy the whole database to `out_file` with the online backup API.
    ///
    /// # Errors
    /// Returns an error when the parent directory or the backup cannot be written.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))?;
        tracing::info!(out_file = %out_file.display(), "wrote database backup");
        Ok(())
    }

    /// Replace this database with a backup file, then migrate to latest.
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
        tracing::info!(in_file = %in_file.display(), "restored database backup");
        Ok(())
    }

    /// Run quick-check, per-category rank contiguity, and schema status checks.
    ///
    /// # Errors
    /// Returns an error when any integrity check query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let schema_status = self.schema_status()?;
        let mut rank_violations = Vec::new();
        if schema_status.pending_versions.is_empty() {
            for category in self.list_categories()? {
                if let Err(err) = check_contiguity(&self.load_category(&category)?) {
                    rank_violations.push(RankViolation { category, message: err.to_string() });
                }
            }
        }

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            rank_violations,
            schema_status,
        })
    }
}

impl ItemRepository for SqliteStore {
    fn load_items(&self, category: &Category) -> Result<Vec<RankedItem>, KernelError> {
        self.load_category(category).map_err(repository_error)
    }

    fn save_items(&mut self, category: &Category, items: &[RankedItem]) -> Result<(), KernelError> {
        self.replace_category(category, items).map_err(repository_error)
    }

    fn categories(&self) -> Result<Vec<Category>, KernelError> {
        self.list_categories().map_err(repository_error)
    }
}

fn repository_error(err: anyhow::Error) -> KernelError {
    KernelError::Repository(format!("{err:#}"))
}

fn load_category_rows(conn: &Connection, category: &Category) -> Result<Vec<RankedItem>> {
    let mut stmt = conn.prepare(
        "SELECT category, item_id, rank, score, created_at, updated_at, details_json
         FROM ranked_items
         WHERE category = ?1
         ORDER BY rank ASC, created_at ASC, item_id ASC",
    )?;
    let mut rows = stmt.query(params![category.as_str()])?;
    let mut items = Vec::new();
    while let Some(row) = rows.next()? {
        items.push(decode_item(row)?);
    }
    Ok(items)
}

fn replace_category_rows(
    tx: &Transaction<'_>,
    category: &Category,
    items: &[RankedItem],
) -> Result<()> {
    if let Some(stray) = items.iter().find(|item| &item.category != category) {
        return Err(anyhow!(
            "item {} belongs to category {} and cannot be saved under {category}",
            stray.id,
            stray.category
        ));
    }

    tx.execute("DELETE FROM ranked_items WHERE category = ?1", params![category.as_str()])
        .context("failed to clear category before replace")?;
    for item in items {
        insert_item(tx, item)?;
    }
    Ok(())
}

fn insert_item(tx: &Transaction<'_>, item: &RankedItem) -> Result<()> {
    tx.execute(
        "INSERT INTO ranked_items(
            category, item_id, rank, score, created_at, updated_at, details_json
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            item.category.as_str(),
            item.id.as_str(),
            i64::from(item.rank),
            item.score,
            rfc3339(item.created_at)?,
            item.updated_at.map(rfc3339).transpose()?,
            serde_json::to_string(&item.details).context("failed to serialize item details")?,
        ],
    )
    .with_context(|| format!("failed to insert item {} into {}", item.id, item.category))?;
    Ok(())
}

fn decode_item(row: &rusqlite::Row<'_>) -> Result<RankedItem> {
    let category_raw: String = row.get(0)?;
    let item_id_raw: String = row.get(1)?;
    let updated_at_raw: Option<String> = row.get(5)?;
    let details_json: String = row.get(6)?;

    Ok(RankedItem {
        category: Category::parse(&category_raw)
            .with_context(|| format!("invalid stored category: {category_raw}"))?,
        id: ItemId::parse(&item_id_raw)
            .with_context(|| format!("invalid stored item id: {item_id_raw}"))?,
        rank: row.get::<_, u32>(2)?,
        score: row.get(3)?,
        created_at: parse_rfc3339(&row.get::<_, String>(4)?)?,
        updated_at: updated_at_raw.as_deref().map(parse_rfc3339).transpose()?,
        details: serde_json::from_str::<ItemDetails>(&details_json)
            .with_context(|| format!("failed to deserialize details for item {item_id_raw}"))?,
    })
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
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

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .and_then(|()| writer.write_all(b"\n"))
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

    let Some(expected) = manifest.files.iter().find(|file| file.path == ITEMS_FILE) else {
        return Err(anyhow!("manifest is missing required file entry: {ITEMS_FILE}"));
    };
    let file_path = in_dir.join(ITEMS_FILE);
    if !file_path.exists() {
        return Err(anyhow!("manifest references missing file {}", file_path.display()));
    }

    let (actual_sha256, actual_records) = ndjson_digest_and_records(&file_path)?;
    if actual_sha256 != expected.sha256 {
        return Err(anyhow!(
            "manifest digest mismatch for {ITEMS_FILE}: expected {}, got {}",
            expected.sha256,
            actual_sha256
        ));
    }
    if actual_records != expected.records {
        return Err(anyhow!(
            "manifest record count mismatch for {ITEMS_FILE}: expected {}, got {}",
            expected.records,
            actual_records
        ));
    }

    Ok(())
}
