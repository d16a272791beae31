use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;
use tempfile::TempDir;

struct Sandbox {
    dir: TempDir,
}

impl Sandbox {
    fn new() -> Self {
        let dir = tempfile::tempdir()
            .unwrap_or_else(|err| panic!("failed to create temp dir: {err}"));
        Self { dir }
    }

    fn db(&self) -> PathBuf {
        self.dir.path().join("places.sqlite3")
    }

    fn export_dir(&self) -> PathBuf {
        self.dir.path().join("exports")
    }

    fn run<I, S>(&self, args: I) -> Output
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        Command::new(env!("CARGO_BIN_EXE_places"))
            .env("PLACES_DB", self.db())
            .env("PLACES_EXPORT_DIR", self.export_dir())
            .env_remove("RUST_LOG")
            .args(args)
            .output()
            .unwrap_or_else(|err| panic!("failed to execute places binary: {err}"))
    }

    fn run_json<I, S>(&self, args: I) -> Value
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = self.run(args);
        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            panic!(
                "places command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
                output.status, stdout, stderr
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let value: Value = serde_json::from_str(&stdout)
            .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"));
        assert_eq!(as_str(&value, "contract_version"), "cli.v1");
        value
    }

    fn add_place(&self, name: &str, category: &str) -> i64 {
        let added = self.run_json([
            "place",
            "add",
            "--name",
            name,
            "--latitude",
            "43.3224",
            "--longitude",
            "-1.9838",
            "--category",
            category,
        ]);
        as_i64(&added, "id")
    }
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn as_bool(value: &Value, key: &str) -> bool {
    value
        .get(key)
        .and_then(Value::as_bool)
        .unwrap_or_else(|| panic!("missing bool field `{key}` in payload: {value}"))
}

fn array_len(value: &Value, key: &str) -> usize {
    value.get(key).and_then(Value::as_array).map(Vec::len).unwrap_or_default()
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

#[test]
fn db_commands_cover_schema_migrate_backup_and_integrity() {
    let sandbox = Sandbox::new();

    let before = sandbox.run_json(["db", "schema-version"]);
    assert_eq!(as_i64(&before, "current_version"), 0);
    assert_eq!(as_i64(&before, "target_version"), 3);

    let dry_run = sandbox.run_json(["db", "migrate", "--dry-run"]);
    assert!(as_bool(&dry_run, "dry_run"));
    assert_eq!(array_len(&dry_run, "would_apply_versions"), 3);

    let still_empty = sandbox.run_json(["db", "schema-version"]);
    assert_eq!(as_i64(&still_empty, "current_version"), 0);

    let migrate = sandbox.run_json(["db", "migrate", "--backfill-seed", "11"]);
    assert_eq!(as_i64(&migrate, "before_version"), 0);
    assert_eq!(as_i64(&migrate, "after_version"), 3);
    assert_eq!(array_len(&migrate, "applied_versions"), 3);

    let again = sandbox.run_json(["db", "migrate"]);
    assert_eq!(array_len(&again, "applied_versions"), 0);

    sandbox.add_place("Ganbara", "bar");
    let backup_file = sandbox.dir.path().join("backups/places.bak");
    let backup = sandbox.run_json(["db", "backup", "--out", path_str(&backup_file)]);
    assert_eq!(as_str(&backup, "status"), "ok");
    assert!(backup_file.exists());

    let restored = sandbox.run_json(["--db", path_str(&backup_file), "place", "list"]);
    assert_eq!(as_i64(&restored, "count"), 1);

    let integrity = sandbox.run_json(["db", "integrity-check"]);
    assert!(as_bool(&integrity, "quick_check_ok"));
}

#[test]
fn place_commands_round_trip_through_the_store() {
    let sandbox = Sandbox::new();

    let cafe = sandbox.add_place("Sakona", "cafe");
    let bar = sandbox.add_place("Atari", "bar");

    let listed = sandbox.run_json(["place", "list"]);
    assert_eq!(as_i64(&listed, "count"), 2);

    let cafes = sandbox.run_json(["place", "list", "--category", "cafe"]);
    assert_eq!(as_i64(&cafes, "count"), 1);

    let shown = sandbox.run_json(["place", "show", "--id", &cafe.to_string()]);
    assert!(as_bool(&shown, "found"));
    let place = shown.get("place").unwrap_or_else(|| panic!("missing place: {shown}"));
    assert_eq!(as_str(place, "nombre"), "Sakona");
    assert_eq!(as_str(place, "categoria"), "CAFE");

    let updated = sandbox.run_json([
        "place",
        "update",
        "--id",
        &cafe.to_string(),
        "--name",
        "Sakona Coffee",
        "--created-at",
        "42",
    ]);
    assert_eq!(as_i64(&updated, "affected"), 1);
    let reread = sandbox.run_json(["place", "show", "--id", &cafe.to_string()]);
    let place = reread.get("place").unwrap_or_else(|| panic!("missing place: {reread}"));
    assert_eq!(as_str(place, "nombre"), "Sakona Coffee");
    assert_eq!(as_i64(place, "fechaCreacion"), 42);

    let favorite =
        sandbox.run_json(["place", "favorite", "--id", &bar.to_string(), "--value", "true"]);
    assert_eq!(as_i64(&favorite, "affected"), 1);
    let favorites = sandbox.run_json(["place", "list", "--favorites"]);
    assert_eq!(as_i64(&favorites, "count"), 1);

    let deleted = sandbox.run_json(["place", "delete", "--id", &bar.to_string()]);
    assert_eq!(as_i64(&deleted, "affected"), 1);
    let deleted_again = sandbox.run_json(["place", "delete", "--id", &bar.to_string()]);
    assert_eq!(as_i64(&deleted_again, "affected"), 0);

    let missing = sandbox.run_json(["place", "show", "--id", &bar.to_string()]);
    assert!(!as_bool(&missing, "found"));
}

#[test]
fn invalid_coordinates_are_rejected_before_insert() {
    let sandbox = Sandbox::new();

    let edge = sandbox.run_json([
        "place",
        "add",
        "--name",
        "Polo",
        "--latitude",
        "90.0",
        "--longitude",
        "-180.0",
        "--category",
        "restaurant",
    ]);
    assert!(as_i64(&edge, "id") > 0);

    let output = sandbox.run([
        "place",
        "add",
        "--name",
        "Beyond",
        "--latitude",
        "90.0001",
        "--longitude",
        "0",
        "--category",
        "restaurant",
    ]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("latitude MUST be in [-90, 90]"), "stderr: {stderr}");

    let listed = sandbox.run_json(["place", "list"]);
    assert_eq!(as_i64(&listed, "count"), 1);
}

#[test]
fn export_and_import_move_places_between_databases() {
    let sandbox = Sandbox::new();
    sandbox.add_place("Bergara", "bar");
    sandbox.add_place("Ogi Berri", "bakery");

    let first = sandbox.run_json(["export"]);
    let second = sandbox.run_json(["export"]);
    assert_eq!(as_i64(&first, "total_count"), 2);
    assert_ne!(as_str(&first, "path"), as_str(&second, "path"));
    assert!(as_str(&first, "path").contains("places_export_"));

    let other_db = sandbox.dir.path().join("other.sqlite3");
    let imported =
        sandbox.run_json(["--db", path_str(&other_db), "import", "--in", as_str(&first, "path")]);
    let summary = imported.get("summary").unwrap_or_else(|| panic!("missing summary: {imported}"));
    assert_eq!(as_i64(summary, "imported"), 2);

    let listed = sandbox.run_json(["--db", path_str(&other_db), "place", "list"]);
    assert_eq!(as_i64(&listed, "count"), 2);
}

#[test]
fn import_of_malformed_document_fails_without_writes() {
    let sandbox = Sandbox::new();
    let bad = sandbox.dir.path().join("bad.json");
    fs::write(
        &bad,
        r#"{"version":"1.0","fecha_exportacion":"2024-01-01 00:00:00","total_lugares":-3,"lugares":[]}"#,
    )
    .unwrap_or_else(|err| panic!("failed to write fixture: {err}"));

    let output = sandbox.run(["import", "--in", path_str(&bad)]);
    assert!(!output.status.success());

    let listed = sandbox.run_json(["place", "list"]);
    assert_eq!(as_i64(&listed, "count"), 0);
}

#[test]
fn import_with_an_invalid_place_is_rejected_as_a_whole() {
    let sandbox = Sandbox::new();
    let document = sandbox.dir.path().join("out_of_range.json");
    fs::write(
        &document,
        r#"{
            "version": "1.0",
            "fecha_exportacion": "2024-01-01 00:00:00",
            "total_lugares": 2,
            "lugares": [
                {"id": 1, "nombre": "Valid", "latitud": 43.3, "longitud": -1.9, "categoria": "BAR", "fechaCreacion": 1},
                {"id": 2, "nombre": "", "latitud": 123.0, "longitud": -500.0, "categoria": "BAR", "fechaCreacion": 2, "rating": 9.5}
            ]
        }"#,
    )
    .unwrap_or_else(|err| panic!("failed to write fixture: {err}"));

    let output = sandbox.run(["import", "--in", path_str(&document)]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("place #1"), "stderr: {stderr}");

    let listed = sandbox.run_json(["place", "list"]);
    assert_eq!(as_i64(&listed, "count"), 0);
}

#[test]
fn export_file_commands_manage_the_well_known_file() {
    let sandbox = Sandbox::new();

    let exists = sandbox.run_json(["export-file", "exists"]);
    assert!(!as_bool(&exists, "exists"));
    let info = sandbox.run_json(["export-file", "info"]);
    assert!(info.get("info").is_some_and(Value::is_null));

    sandbox.add_place("Zazpi", "restaurant");
    let latest = sandbox.run_json(["export", "--latest"]);
    assert!(as_str(&latest, "path").ends_with("places_export.json"));

    let exists = sandbox.run_json(["export-file", "exists"]);
    assert!(as_bool(&exists, "exists"));
    let info = sandbox.run_json(["export-file", "info"]);
    let details = info.get("info").unwrap_or_else(|| panic!("missing info: {info}"));
    assert!(as_i64(details, "size_bytes") > 0);

    let deleted = sandbox.run_json(["export-file", "delete"]);
    assert!(as_bool(&deleted, "deleted"));
    let deleted_again = sandbox.run_json(["export-file", "delete"]);
    assert!(!as_bool(&deleted_again, "deleted"));
}
