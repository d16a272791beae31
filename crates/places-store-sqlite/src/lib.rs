use std::fs;
use std::path::{Path, PathBuf};

use places_core::{epoch_millis, Category, ExportDocument, Place};
use rusqlite::{params, Connection, DatabaseName, OpenFlags, OptionalExtension, Row};
use serde::Serialize;
use time::OffsetDateTime;

pub mod error;
pub mod export_files;
pub mod migrate;

pub use error::{MigrationError, StoreError};
pub use export_files::{ExportFileInfo, EXPORT_FILE_NAME};
pub use migrate::{
    AppliedStep, BackfillReport, MigrationOptions, MigrationReport, SchemaStatus,
    LATEST_SCHEMA_VERSION,
};

use error::ErrorContext;

pub(crate) const PLACE_COLUMNS: &str =
    "id, name, description, latitude, longitude, category, createdAt, rating, isFavorite, cuisineType";

const NEWEST_FIRST: &str = "ORDER BY createdAt DESC, id DESC";

/// Handle to a migrated places database.
///
/// Holds only the path: every operation opens its own connection and drops it before
/// returning.
#[derive(Debug, Clone)]
pub struct PlaceStore {
    path: PathBuf,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported: usize,
    pub ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub schema_status: SchemaStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportTarget {
    /// `places_export_YYYYMMDD_HHmmss.json`, never overwriting an existing file.
    Timestamped,
    /// The well-known `places_export.json`.
    Latest,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ExportOutcome {
    pub path: PathBuf,
    pub total_count: i64,
}

/// Report the schema status of the file at `path` without migrating, creating or
/// reconfiguring it. A missing file reports version 0.
///
/// # Errors
/// Returns an error when the file cannot be opened or its schema cannot be read.
pub fn inspect_schema(path: &Path) -> Result<SchemaStatus, StoreError> {
    if !path.exists() {
        return Ok(migrate::status_for_version(0, false));
    }

    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .with_context(|| format!("failed to open sqlite database read-only at {}", path.display()))?;
    migrate::schema_status(&conn)
}

impl PlaceStore {
    /// Open the database at `path`, creating it if needed, and migrate it to the latest
    /// schema with default options.
    ///
    /// # Errors
    /// Returns an error when the file cannot be opened or migration fails. No store is
    /// returned in that case.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::open_with(path, &MigrationOptions::default()).map(|(store, _)| store)
    }

    /// Like [`PlaceStore::open`], also returning what the migration did.
    ///
    /// # Errors
    /// Returns an error when the file cannot be opened or migration fails.
    pub fn open_with(
        path: &Path,
        options: &MigrationOptions,
    ) -> Result<(Self, MigrationReport), StoreError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for database {}", path.display())
            })?;
        }

        let mut conn = open_connection(path)?;
        let report = migrate::migrate(&mut conn, options)?;
        if !report.applied.is_empty() {
            tracing::info!(
                path = %path.display(),
                from = report.from_version,
                to = report.to_version,
                "places database migrated"
            );
        }

        Ok((Self { path: path.to_path_buf() }, report))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        open_connection(&self.path)
    }

    /// Persist `place` with a fresh id and `createdAt = now`. The passed `id` and
    /// `created_at` are ignored.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn insert(&self, place: &Place) -> Result<i64, StoreError> {
        let conn = self.connect()?;
        let created_at = epoch_millis(OffsetDateTime::now_utc());
        insert_row(&conn, place, created_at).context("failed to insert place")
    }

    /// # Errors
    /// Returns an error when the query fails.
    pub fn get_all(&self) -> Result<Vec<Place>, StoreError> {
        let conn = self.connect()?;
        query_places(&conn, &format!("SELECT {PLACE_COLUMNS} FROM places {NEWEST_FIRST}"), [])
    }

    /// # Errors
    /// Returns an error when the query fails.
    pub fn get_by_id(&self, id: i64) -> Result<Option<Place>, StoreError> {
        let conn = self.connect()?;
        conn.query_row(
            &format!("SELECT {PLACE_COLUMNS} FROM places WHERE id = ?1"),
            params![id],
            place_from_row,
        )
        .optional()
        .with_context(|| format!("failed to load place {id}"))
    }

    /// # Errors
    /// Returns an error when the query fails.
    pub fn get_by_category(&self, category: Category) -> Result<Vec<Place>, StoreError> {
        let conn = self.connect()?;
        query_places(
            &conn,
            &format!("SELECT {PLACE_COLUMNS} FROM places WHERE category = ?1 {NEWEST_FIRST}"),
            params![category.code()],
        )
    }

    /// # Errors
    /// Returns an error when the query fails.
    pub fn get_favorites(&self) -> Result<Vec<Place>, StoreError> {
        let conn = self.connect()?;
        query_places(
            &conn,
            &format!("SELECT {PLACE_COLUMNS} FROM places WHERE isFavorite = 1 {NEWEST_FIRST}"),
            [],
        )
    }

    /// # Errors
    /// Returns an error when the query fails.
    pub fn count(&self) -> Result<u64, StoreError> {
        let conn = self.connect()?;
        let count = conn
            .query_row("SELECT COUNT(*) FROM places", [], |row| row.get::<_, i64>(0))
            .context("failed to count places")?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Overwrite every column of row `place.id`, `createdAt` included. Returns the number
    /// of rows changed (0 when the id is unknown).
    ///
    /// # Errors
    /// Returns an error when the update fails.
    pub fn update(&self, place: &Place) -> Result<usize, StoreError> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE places
             SET name = ?1, description = ?2, latitude = ?3, longitude = ?4, category = ?5,
                 createdAt = ?6, rating = ?7, isFavorite = ?8, cuisineType = ?9
             WHERE id = ?10",
            params![
                place.name,
                place.description,
                place.latitude,
                place.longitude,
                place.category.code(),
                place.created_at,
                place.rating,
                place.is_favorite,
                place.cuisine_type,
                place.id,
            ],
        )
        .with_context(|| format!("failed to update place {}", place.id))
    }

    /// # Errors
    /// Returns an error when the update fails.
    pub fn set_favorite(&self, id: i64, is_favorite: bool) -> Result<usize, StoreError> {
        let conn = self.connect()?;
        conn.execute("UPDATE places SET isFavorite = ?1 WHERE id = ?2", params![is_favorite, id])
            .with_context(|| format!("failed to set favorite flag on place {id}"))
    }

    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete(&self, id: i64) -> Result<usize, StoreError> {
        let conn = self.connect()?;
        conn.execute("DELETE FROM places WHERE id = ?1", params![id])
            .with_context(|| format!("failed to delete place {id}"))
    }

    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_all(&self) -> Result<usize, StoreError> {
        let conn = self.connect()?;
        conn.execute("DELETE FROM places", []).context("failed to delete all places")
    }

    /// # Errors
    /// Returns an error when the query fails.
    pub fn exists(&self, id: i64) -> Result<bool, StoreError> {
        let conn = self.connect()?;
        let exists = conn
            .query_row("SELECT EXISTS(SELECT 1 FROM places WHERE id = ?1)", params![id], |row| {
                row.get::<_, i64>(0)
            })
            .with_context(|| format!("failed to check if place {id} exists"))?;
        Ok(exists == 1)
    }

    /// Insert every candidate in one transaction with fresh ids, keeping each candidate's
    /// `created_at`. Nothing is written if any insert fails.
    ///
    /// # Errors
    /// Returns an error when the transaction cannot be started, an insert fails, or the
    /// commit fails.
    pub fn import_places(&self, places: &[Place]) -> Result<ImportSummary, StoreError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction().context("failed to start import transaction")?;

        let mut ids = Vec::with_capacity(places.len());
        for (index, place) in places.iter().enumerate() {
            let id = insert_row(&tx, place, place.created_at)
                .with_context(|| format!("failed to import place #{index} ({:?})", place.name))?;
            ids.push(id);
        }

        tx.commit().context("failed to commit import transaction")?;
        tracing::info!(imported = ids.len(), "imported places");
        Ok(ImportSummary { imported: ids.len(), ids })
    }

    /// Import the places of an already parsed document.
    ///
    /// # Errors
    /// See [`PlaceStore::import_places`].
    pub fn import_document(&self, document: &ExportDocument) -> Result<ImportSummary, StoreError> {
        if !document.count_matches() {
            tracing::warn!(
                declared = document.total_count,
                actual = document.places.len(),
                "export document total_lugares disagrees with its entries"
            );
        }
        self.import_places(&document.places)
    }

    /// Parse export-document text and import its places.
    ///
    /// # Errors
    /// Returns [`StoreError::Codec`] for a malformed document, otherwise see
    /// [`PlaceStore::import_places`].
    pub fn import_document_text(&self, text: &str) -> Result<ImportSummary, StoreError> {
        self.import_document(&ExportDocument::parse(text)?)
    }

    /// Import the export document at `path`.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or parsed, or the import fails.
    pub fn import_file(&self, path: &Path) -> Result<ImportSummary, StoreError> {
        self.import_document(&export_files::read_export_document(path)?)
    }

    /// Export the full collection (newest first) into `dir`.
    ///
    /// # Errors
    /// Returns an error when reading places, building the document, or writing fails.
    pub fn export_to_dir(&self, dir: &Path, target: ExportTarget) -> Result<ExportOutcome, StoreError> {
        let places = self.get_all()?;
        let exported_at = OffsetDateTime::now_utc();
        let document = places_core::export(&places, exported_at)?;

        let path = match target {
            ExportTarget::Timestamped => {
                export_files::write_timestamped_export(dir, &document, exported_at)?
            }
            ExportTarget::Latest => export_files::write_latest_export(dir, &document)?,
        };

        Ok(ExportOutcome { path, total_count: document.total_count })
    }

    /// # Errors
    /// Returns an error when schema metadata cannot be read.
    pub fn schema_status(&self) -> Result<SchemaStatus, StoreError> {
        let conn = self.connect()?;
        migrate::schema_status(&conn)
    }

    /// Create a `SQLite` backup file of the current database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<(), StoreError> {
        if let Some(parent) = out_file.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        let conn = self.connect()?;
        conn.backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Run `PRAGMA quick_check` and report schema status.
    ///
    /// # Errors
    /// Returns an error when an existence query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport, StoreError> {
        let conn = self.connect()?;
        let quick_check_message: String = conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;
        let schema_status = migrate::schema_status(&conn)?;

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            schema_status,
        })
    }
}

fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .context("failed to configure sqlite pragmas")?;

    Ok(conn)
}

fn insert_row(conn: &Connection, place: &Place, created_at: i64) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO places(
           name, description, latitude, longitude, category, createdAt, rating, isFavorite, cuisineType
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            place.name,
            place.description,
            place.latitude,
            place.longitude,
            place.category.code(),
            created_at,
            place.rating,
            place.is_favorite,
            place.cuisine_type,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn query_places<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<Place>, StoreError> {
    let mut stmt = conn.prepare(sql).context("failed to prepare places query")?;
    let rows = stmt.query_map(params, place_from_row).context("failed to query places")?;
    rows.collect::<Result<Vec<_>, _>>().context("failed to decode place row")
}

/// Decode a row selected with [`PLACE_COLUMNS`]. Nullable v2 columns read as defaults.
pub(crate) fn place_from_row(row: &Row<'_>) -> rusqlite::Result<Place> {
    let category: String = row.get(5)?;
    Ok(Place {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        latitude: row.get(3)?,
        longitude: row.get(4)?,
        category: Category::from_code(&category),
        created_at: row.get(6)?,
        rating: row.get::<_, Option<f64>>(7)?.unwrap_or_default(),
        is_favorite: row.get::<_, Option<bool>>(8)?.unwrap_or_default(),
        cuisine_type: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
    })
}
