//! Schema migration engine for the places store.
//!
//! The on-disk version lives in the `schema_migrations` ledger (mirrored into
//! `PRAGMA user_version`). Upgrades walk [`MIGRATION_STEPS`] one version at a time;
//! every step commits its structural change together with its ledger row, so a failed
//! step leaves the previous version in place.

use places_core::Category;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use time::OffsetDateTime;

use crate::error::{ErrorContext, MigrationError, StoreError};

pub const LATEST_SCHEMA_VERSION: i64 = 3;

pub(crate) const PLACES_TABLE: &str = "places";
const V1_SET_ASIDE_TABLE: &str = "places_v1_backup";

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const CREATE_PLACES_V1_SQL: &str = r"
CREATE TABLE places (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL,
  description TEXT,
  latitude REAL NOT NULL,
  longitude REAL NOT NULL,
  category TEXT NOT NULL,
  createdAt INTEGER NOT NULL
);
";

const CREATE_PLACES_V2_SQL: &str = r"
CREATE TABLE places (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL,
  description TEXT,
  latitude REAL NOT NULL,
  longitude REAL NOT NULL,
  category TEXT NOT NULL,
  createdAt INTEGER NOT NULL,
  rating REAL DEFAULT 0.0,
  isFavorite INTEGER DEFAULT 0,
  cuisineType TEXT DEFAULT ''
);
";

const COPY_V1_ROWS_SQL: &str = r"
INSERT INTO places(id, name, description, latitude, longitude, category, createdAt)
SELECT id, name, description, latitude, longitude, category, createdAt
FROM places_v1_backup
ORDER BY id ASC
";

// Created after the set-aside table is dropped: renamed tables keep their index names.
const PLACES_INDEXES_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_places_created_at ON places(createdAt);
CREATE INDEX IF NOT EXISTS idx_places_category ON places(category);
";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationOptions {
    /// Run the cosmetic backfill after the v1->v2 rewrite.
    pub backfill: bool,
    /// Seed for backfilled ratings; `None` draws from OS entropy.
    pub backfill_seed: Option<u64>,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self { backfill: true, backfill_seed: None }
    }
}

impl MigrationOptions {
    fn rng(&self) -> StdRng {
        match self.backfill_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AppliedStep {
    pub from: i64,
    pub to: i64,
    pub name: &'static str,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BackfillReport {
    pub cuisine_filled: usize,
    pub ratings_filled: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MigrationReport {
    pub from_version: i64,
    pub to_version: i64,
    pub inferred_from_legacy: bool,
    pub applied: Vec<AppliedStep>,
    pub backfill: Option<BackfillReport>,
}

struct StepContext {
    backfill_enabled: bool,
    rng: StdRng,
    backfill: Option<BackfillReport>,
}

type StepFn = fn(&mut Connection, &mut StepContext) -> Result<(), StoreError>;

struct MigrationStep {
    from: i64,
    to: i64,
    name: &'static str,
    apply: StepFn,
}

const MIGRATION_STEPS: [MigrationStep; 3] = [
    MigrationStep { from: 0, to: 1, name: "create_places", apply: create_places_v1 },
    MigrationStep {
        from: 1,
        to: 2,
        name: "add_rating_favorite_cuisine",
        apply: add_rating_favorite_cuisine,
    },
    MigrationStep { from: 2, to: 3, name: "normalize_categories", apply: normalize_categories },
];

/// Report current and target schema versions without modifying the file.
///
/// # Errors
/// Returns an error when schema metadata cannot be read or the table shape is unknown.
pub fn schema_status(conn: &Connection) -> Result<SchemaStatus, StoreError> {
    let (current_version, inferred_from_legacy) = detect_effective_schema_version(conn)?;
    Ok(status_for_version(current_version, inferred_from_legacy))
}

pub(crate) fn status_for_version(current_version: i64, inferred_from_legacy: bool) -> SchemaStatus {
    let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
        ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
    } else {
        Vec::new()
    };

    SchemaStatus {
        current_version,
        target_version: LATEST_SCHEMA_VERSION,
        pending_versions,
        inferred_from_legacy,
    }
}

/// Bring the file up to [`LATEST_SCHEMA_VERSION`], one step at a time.
///
/// # Errors
/// Returns [`MigrationError::Downgrade`] for files newer than this build,
/// [`MigrationError::InvalidSchema`] for unrecognised table shapes and
/// [`MigrationError::StepFailed`] when a step fails after rollback.
pub fn migrate(conn: &mut Connection, options: &MigrationOptions) -> Result<MigrationReport, StoreError> {
    let (from_version, inferred_from_legacy) = detect_effective_schema_version(conn)?;

    if from_version > LATEST_SCHEMA_VERSION {
        tracing::error!(
            found = from_version,
            supported = LATEST_SCHEMA_VERSION,
            "refusing to open a database written by a newer schema"
        );
        return Err(MigrationError::Downgrade {
            found: from_version,
            supported: LATEST_SCHEMA_VERSION,
        }
        .into());
    }

    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
        .context("failed to apply schema_migrations table")?;

    if inferred_from_legacy {
        // Legacy file: record the versions it already has so later opens read the ledger.
        for version in 1..=from_version {
            record_schema_version(conn, version)?;
        }
        tracing::info!(version = from_version, "adopted legacy database into migration ledger");
    }

    let mut context = StepContext {
        backfill_enabled: options.backfill,
        rng: options.rng(),
        backfill: None,
    };
    let mut applied = Vec::new();
    let mut version = from_version;

    for step in MIGRATION_STEPS.iter().filter(|step| step.from >= from_version) {
        tracing::info!(from = step.from, to = step.to, step = step.name, "applying schema migration");
        (step.apply)(conn, &mut context).map_err(|err| match err {
            StoreError::Migration(_) => err,
            other => MigrationError::StepFailed {
                from: step.from,
                to: step.to,
                reason: other.to_string(),
                recovered: true,
            }
            .into(),
        })?;
        applied.push(AppliedStep { from: step.from, to: step.to, name: step.name });
        version = step.to;
    }

    if version != LATEST_SCHEMA_VERSION {
        return Err(MigrationError::InvalidSchema(format!(
            "migration chain ended at version {version}; expected {LATEST_SCHEMA_VERSION}"
        ))
        .into());
    }

    if applied.is_empty() {
        tracing::debug!(version, "schema already current");
    }

    Ok(MigrationReport {
        from_version,
        to_version: version,
        inferred_from_legacy,
        applied,
        backfill: context.backfill,
    })
}

fn create_places_v1(conn: &mut Connection, _context: &mut StepContext) -> Result<(), StoreError> {
    let tx = conn.transaction().context("failed to start migration v1 transaction")?;
    tx.execute_batch(CREATE_PLACES_V1_SQL).context("failed to create v1 places table")?;
    record_schema_version(&tx, 1)?;
    tx.commit().context("failed to commit migration v1")?;
    Ok(())
}

fn add_rating_favorite_cuisine(
    conn: &mut Connection,
    context: &mut StepContext,
) -> Result<(), StoreError> {
    restore_set_aside_table(conn)?;

    if let Err(err) = rewrite_places_v2(conn) {
        let recovered = match restore_set_aside_table(conn) {
            Ok(_) => places_table_is_v1(conn).unwrap_or(false),
            Err(restore_err) => {
                tracing::error!(error = %restore_err, "failed to restore places table after migration v2 error");
                false
            }
        };
        tracing::error!(error = %err, recovered, "migration v2 rolled back");
        return Err(MigrationError::StepFailed {
            from: 1,
            to: 2,
            reason: err.to_string(),
            recovered,
        }
        .into());
    }

    if context.backfill_enabled {
        context.backfill = Some(backfill_v2_defaults(conn, &mut context.rng));
    }

    Ok(())
}

fn rewrite_places_v2(conn: &mut Connection) -> Result<(), StoreError> {
    let tx = conn.transaction().context("failed to start migration v2 transaction")?;

    let id_high_water = sequence_value(&tx, PLACES_TABLE)?;

    tx.execute_batch("ALTER TABLE places RENAME TO places_v1_backup;")
        .context("failed to set aside v1 places table")?;
    tx.execute_batch(CREATE_PLACES_V2_SQL).context("failed to create v2 places table")?;
    let copied =
        tx.execute(COPY_V1_ROWS_SQL, []).context("failed to copy v1 places rows into v2")?;
    tx.execute_batch("DROP TABLE places_v1_backup;")
        .context("failed to drop set-aside v1 places table")?;
    tx.execute_batch(PLACES_INDEXES_SQL).context("failed to create v2 indexes")?;

    if let Some(seq) = id_high_water {
        carry_sequence_value(&tx, PLACES_TABLE, seq)?;
    }

    record_schema_version(&tx, 2)?;
    tx.commit().context("failed to commit migration v2")?;

    tracing::info!(rows = copied, "rewrote places table into v2 shape");
    Ok(())
}

/// Put a set-aside v1 table back under its real name. Returns whether anything was restored.
fn restore_set_aside_table(conn: &Connection) -> Result<bool, StoreError> {
    if !table_exists(conn, V1_SET_ASIDE_TABLE)? {
        return Ok(false);
    }

    tracing::warn!(table = V1_SET_ASIDE_TABLE, "restoring places table from set-aside copy");
    let tx = conn.unchecked_transaction().context("failed to start restore transaction")?;
    tx.execute_batch(
        "DROP TABLE IF EXISTS places;
         ALTER TABLE places_v1_backup RENAME TO places;",
    )
    .context("failed to restore set-aside places table")?;
    tx.commit().context("failed to commit places table restore")?;
    Ok(true)
}

fn places_table_is_v1(conn: &Connection) -> Result<bool, StoreError> {
    Ok(table_exists(conn, PLACES_TABLE)? && !table_has_column(conn, PLACES_TABLE, "rating")?)
}

/// Best effort: a failure here is logged and reported but leaves the v2 shape in place.
fn backfill_v2_defaults(conn: &mut Connection, rng: &mut StdRng) -> BackfillReport {
    match try_backfill_v2_defaults(conn, rng) {
        Ok((cuisine_filled, ratings_filled)) => {
            tracing::info!(cuisine_filled, ratings_filled, "backfilled v2 defaults");
            BackfillReport { cuisine_filled, ratings_filled, error: None }
        }
        Err(err) => {
            tracing::warn!(error = %err, "v2 backfill failed; structural migration kept");
            BackfillReport { cuisine_filled: 0, ratings_filled: 0, error: Some(err.to_string()) }
        }
    }
}

fn try_backfill_v2_defaults(
    conn: &mut Connection,
    rng: &mut StdRng,
) -> Result<(usize, usize), StoreError> {
    let tx = conn.transaction().context("failed to start backfill transaction")?;

    let rows = {
        let mut stmt = tx
            .prepare("SELECT id, category, cuisineType, rating FROM places ORDER BY id ASC")
            .context("failed to prepare backfill scan")?;
        let mapped = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<f64>>(3)?,
                ))
            })
            .context("failed to scan places for backfill")?;
        mapped.collect::<Result<Vec<_>, _>>().context("failed to read place row for backfill")?
    };

    let mut cuisine_filled = 0;
    let mut ratings_filled = 0;

    for (id, category, cuisine_type, rating) in rows {
        let cuisine_type = match cuisine_type {
            Some(existing) if !existing.trim().is_empty() => existing,
            _ => {
                cuisine_filled += 1;
                Category::from_legacy_text(&category).default_cuisine().to_string()
            }
        };
        let rating = match rating {
            Some(existing) if existing > 0.0 => existing,
            _ => {
                ratings_filled += 1;
                f64::from(rng.gen_range(35_u8..=50)) / 10.0
            }
        };

        tx.execute(
            "UPDATE places SET cuisineType = ?1, rating = ?2 WHERE id = ?3",
            params![cuisine_type, rating, id],
        )
        .with_context(|| format!("failed to backfill place {id}"))?;
    }

    tx.commit().context("failed to commit backfill")?;
    Ok((cuisine_filled, ratings_filled))
}

fn normalize_categories(conn: &mut Connection, _context: &mut StepContext) -> Result<(), StoreError> {
    let tx = conn.transaction().context("failed to start migration v3 transaction")?;
    let rewritten = normalize_category_values(&tx)?;
    record_schema_version(&tx, 3)?;
    tx.commit().context("failed to commit migration v3")?;

    tracing::info!(rows = rewritten, "normalized place categories to codes");
    Ok(())
}

/// Rewrite every stored category value to the code it resolves to. Returns the number of
/// rows changed; already-normalized data is left untouched.
///
/// # Errors
/// Returns an error when the distinct values cannot be read or a rewrite fails.
pub fn normalize_category_values(conn: &Connection) -> Result<usize, StoreError> {
    let distinct = {
        let mut stmt = conn
            .prepare("SELECT DISTINCT category FROM places")
            .context("failed to prepare distinct category scan")?;
        let mapped = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("failed to scan distinct categories")?;
        mapped.collect::<Result<Vec<_>, _>>().context("failed to read category value")?
    };

    let mut rewritten = 0;
    for raw in distinct {
        let resolved = Category::from_legacy_text(&raw);
        if resolved.code() == raw {
            continue;
        }
        tracing::debug!(from = %raw, to = resolved.code(), "normalizing category value");
        rewritten += conn
            .execute(
                "UPDATE places SET category = ?1 WHERE category = ?2",
                params![resolved.code(), raw],
            )
            .with_context(|| format!("failed to normalize category value {raw:?}"))?;
    }

    Ok(rewritten)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool), StoreError> {
    let recorded = recorded_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, PLACES_TABLE)? {
        return Ok((0, false));
    }

    let user_version = conn
        .query_row("PRAGMA user_version", [], |row| row.get::<_, i64>(0))
        .context("failed to read PRAGMA user_version")?;
    if user_version > 0 {
        return Ok((user_version, true));
    }

    if table_has_column(conn, PLACES_TABLE, "rating")? {
        return Ok((2, true));
    }

    if table_has_column(conn, PLACES_TABLE, "name")? {
        return Ok((1, true));
    }

    Err(MigrationError::InvalidSchema(
        "places table exists but has neither v1 nor v2 columns".to_string(),
    )
    .into())
}

fn recorded_schema_version(conn: &Connection) -> Result<i64, StoreError> {
    if !table_exists(conn, "schema_migrations")? {
        return Ok(0);
    }

    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
        row.get::<_, i64>(0)
    })
    .context("failed to read current schema version")
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now_rfc3339()?],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    conn.execute_batch(&format!("PRAGMA user_version = {version};"))
        .with_context(|| format!("failed to mirror schema version {version} into user_version"))?;
    Ok(())
}

fn sequence_value(conn: &Connection, table: &str) -> Result<Option<i64>, StoreError> {
    if !table_exists(conn, "sqlite_sequence")? {
        return Ok(None);
    }

    conn.query_row("SELECT seq FROM sqlite_sequence WHERE name = ?1", params![table], |row| {
        row.get::<_, i64>(0)
    })
    .optional()
    .with_context(|| format!("failed to read id sequence for {table}"))
}

/// Keep AUTOINCREMENT from handing out ids that were used (and deleted) before a rewrite.
fn carry_sequence_value(conn: &Connection, table: &str, seq: i64) -> Result<(), StoreError> {
    let updated = conn
        .execute(
            "UPDATE sqlite_sequence SET seq = MAX(seq, ?2) WHERE name = ?1",
            params![table, seq],
        )
        .with_context(|| format!("failed to carry id sequence for {table}"))?;
    if updated == 0 {
        conn.execute("INSERT INTO sqlite_sequence(name, seq) VALUES (?1, ?2)", params![table, seq])
            .with_context(|| format!("failed to seed id sequence for {table}"))?;
    }
    Ok(())
}

pub(crate) fn table_exists(conn: &Connection, table_name: &str) -> Result<bool, StoreError> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

pub(crate) fn table_has_column(
    conn: &Connection,
    table: &str,
    column: &str,
) -> Result<bool, StoreError> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([]).context("failed to query table_info")?;

    while let Some(row) = rows.next().context("failed to read table_info row")? {
        let name: String = row.get(1).context("failed to read table_info column name")?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

pub(crate) fn now_rfc3339() -> Result<String, StoreError> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| StoreError::Timestamp(err.to_string()))
}
