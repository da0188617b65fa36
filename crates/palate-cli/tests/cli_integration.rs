use std::ffi::OsStr;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_palate<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_palate"))
        .args(args)
        .env_remove("PALATE_LOG")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute palate binary: {err}"))
}

fn run_palate_with_stdin<I, S>(args: I, stdin: &str) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut child = Command::new(env!("CARGO_BIN_EXE_palate"))
        .args(args)
        .env_remove("PALATE_LOG")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap_or_else(|err| panic!("failed to spawn palate binary: {err}"));
    child
        .stdin
        .take()
        .unwrap_or_else(|| panic!("child stdin should be piped"))
        .write_all(stdin.as_bytes())
        .unwrap_or_else(|err| panic!("failed to write child stdin: {err}"));
    child.wait_with_output().unwrap_or_else(|err| panic!("failed to wait for palate: {err}"))
}

fn parse_success(output: &Output) -> Value {
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "palate command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    parse_success(&run_palate(args))
}

fn run_failure<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_palate(args);
    assert!(
        !output.status.success(),
        "command should have failed; stdout:\n{}",
        String::from_utf8_lossy(&output.stdout)
    );
    String::from_utf8_lossy(&output.stderr).to_string()
}

fn as_u64(value: &Value, key: &str) -> u64 {
    value
        .get(key)
        .and_then(Value::as_u64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_f64(value: &Value, key: &str) -> f64 {
    value
        .get(key)
        .and_then(Value::as_f64)
        .unwrap_or_else(|| panic!("missing number field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn as_array<'a>(value: &'a Value, key: &str) -> &'a Vec<Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing array field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn add_at_rank(db: &Path, id: &str, name: &str, rank: u32) -> Value {
    let rank = rank.to_string();
    run_json([
        "--db",
        path_str(db),
        "item",
        "add",
        "--category",
        "wine",
        "--name",
        name,
        "--id",
        id,
        "--rank",
        rank.as_str(),
    ])
}

fn listed_ids(db: &Path, category: &str) -> Vec<String> {
    let listed = run_json(["--db", path_str(db), "item", "list", "--category", category]);
    as_array(&listed, "items").iter().map(|item| as_str(item, "id").to_string()).collect()
}

#[test]
fn migrate_reports_schema_versions() {
    let dir = unique_temp_dir("palate-cli-migrate");
    let db = dir.join("palate.sqlite3");

    let dry_run = run_json(["--db", path_str(&db), "db", "migrate", "--dry-run"]);
    assert_eq!(as_str(&dry_run, "contract_version"), "cli.v1");
    assert_eq!(dry_run["would_apply_versions"], serde_json::json!([1]));

    let migrated = run_json(["--db", path_str(&db), "db", "migrate"]);
    assert_eq!(as_u64(&migrated, "after_version"), 1);

    let status = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(status["up_to_date"], Value::Bool(true));
}

#[test]
fn first_item_then_preferred_item_take_the_top() {
    let dir = unique_temp_dir("palate-cli-first");
    let db = dir.join("palate.sqlite3");

    let first = add_at_rank(&db, "barolo", "Barolo", 1);
    assert_eq!(as_u64(&first["item"], "rank"), 1);
    assert_eq!(as_str(&first["item"], "display_score"), "10.0");
    assert_eq!(as_str(&first["item"], "tier"), "exceptional");

    let second = run_json([
        "--db",
        path_str(&db),
        "item",
        "add",
        "--category",
        "wine",
        "--name",
        "Chianti",
        "--id",
        "chianti",
        "--choice",
        "new",
    ]);
    assert_eq!(as_str(&second, "placement"), "comparisons");
    assert_eq!(as_u64(&second, "wins"), 1);
    assert_eq!(as_u64(&second["item"], "rank"), 1);

    let listed = run_json(["--db", path_str(&db), "item", "list", "--category", "wine"]);
    let items = as_array(&listed, "items");
    assert_eq!(items.len(), 2);
    assert_eq!(as_str(&items[1], "id"), "barolo");
    assert!((as_f64(&items[1], "score") - 9.5).abs() < f64::EPSILON);
}

#[test]
fn compare_set_and_losing_answers_place_item_last() {
    let dir = unique_temp_dir("palate-cli-compare");
    let db = dir.join("palate.sqlite3");
    for (index, id) in ["a", "b", "c"].into_iter().enumerate() {
        add_at_rank(&db, id, id, u32::try_from(index + 1).unwrap_or(u32::MAX));
    }

    let plan = run_json(["--db", path_str(&db), "item", "compare-set", "--category", "wine"]);
    let planned = as_array(&plan, "compare_set")
        .iter()
        .map(|item| as_str(item, "id").to_string())
        .collect::<Vec<_>>();
    assert_eq!(planned, vec!["a", "b", "c"]);

    let added = run_json([
        "--db",
        path_str(&db),
        "item",
        "add",
        "--category",
        "wine",
        "--name",
        "d",
        "--id",
        "d",
        "--choice",
        "existing",
        "--choice",
        "existing",
        "--choice",
        "existing",
    ]);
    assert_eq!(as_u64(&added["item"], "rank"), 4);
    assert_eq!(listed_ids(&db, "wine"), vec!["a", "b", "c", "d"]);

    let stderr = run_failure([
        "--db",
        path_str(&db),
        "item",
        "add",
        "--category",
        "wine",
        "--name",
        "e",
        "--choice",
        "new",
        "--choice",
        "new",
        "--choice",
        "new",
        "--choice",
        "new",
        "--choice",
        "new",
    ]);
    assert!(stderr.contains("more choices supplied"), "unexpected stderr: {stderr}");
    assert_eq!(listed_ids(&db, "wine").len(), 4);
}

#[test]
fn interactive_add_reads_answers_from_stdin() {
    let dir = unique_temp_dir("palate-cli-interactive");
    let db = dir.join("palate.sqlite3");
    for (index, id) in ["a", "b", "c", "d"].into_iter().enumerate() {
        add_at_rank(&db, id, id, u32::try_from(index + 1).unwrap_or(u32::MAX));
    }

    let output = run_palate_with_stdin(
        [
            "--db",
            path_str(&db),
            "item",
            "add",
            "--category",
            "wine",
            "--name",
            "Favourite",
            "--id",
            "favourite",
            "--interactive",
        ],
        "n\nn\nn\n",
    );
    let added = parse_success(&output);
    assert_eq!(as_u64(&added, "wins"), 3);
    assert_eq!(as_u64(&added, "inferred_wins"), 1);
    assert_eq!(as_array(&added, "outcomes").len(), 3);
    assert_eq!(as_u64(&added["item"], "rank"), 1);

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Which do you prefer?"), "prompt missing from stderr: {stderr}");
}

#[test]
fn delete_rerank_and_update_keep_ranks_contiguous() {
    let dir = unique_temp_dir("palate-cli-edit");
    let db = dir.join("palate.sqlite3");
    for (index, id) in ["a", "b", "c", "d"].into_iter().enumerate() {
        add_at_rank(&db, id, id, u32::try_from(index + 1).unwrap_or(u32::MAX));
    }

    let reranked = run_json([
        "--db", path_str(&db), "item", "rerank", "--category", "wine", "--id", "d", "--rank", "1",
    ]);
    assert_eq!(as_u64(&reranked["item"], "rank"), 1);
    assert_eq!(listed_ids(&db, "wine"), vec!["d", "a", "b", "c"]);

    let deleted =
        run_json(["--db", path_str(&db), "item", "delete", "--category", "wine", "--id", "a"]);
    assert_eq!(deleted["deleted"], Value::Bool(true));
    assert_eq!(as_u64(&deleted, "remaining"), 3);
    assert_eq!(listed_ids(&db, "wine"), vec!["d", "b", "c"]);

    let missing =
        run_json(["--db", path_str(&db), "item", "delete", "--category", "wine", "--id", "zz"]);
    assert_eq!(missing["deleted"], Value::Bool(false));

    let updated = run_json([
        "--db",
        path_str(&db),
        "item",
        "update",
        "--category",
        "wine",
        "--id",
        "b",
        "--producer",
        "Cantina",
        "--with",
        "family",
        "--extra",
        "vintage=2019",
    ]);
    let item = &updated["item"];
    assert_eq!(as_u64(item, "rank"), 2);
    assert_eq!(as_str(&item["details"], "name"), "b");
    assert_eq!(as_str(&item["details"], "producer"), "Cantina");
    assert_eq!(as_str(&item["details"]["memory"], "with"), "family");
    assert_eq!(item["details"]["extra"]["vintage"], serde_json::json!(2019));
    assert!(item["updated_at"].is_string());

    let stderr = run_failure([
        "--db", path_str(&db), "item", "rerank", "--category", "wine", "--id", "b", "--rank", "9",
    ]);
    assert!(stderr.contains("invalid rank 9"), "unexpected stderr: {stderr}");

    let stderr = run_failure([
        "--db", path_str(&db), "item", "rerank", "--category", "wine", "--id", "zz", "--rank", "1",
    ]);
    assert!(stderr.contains("not found"), "unexpected stderr: {stderr}");

    let integrity = run_json(["--db", path_str(&db), "db", "integrity-check"]);
    assert_eq!(integrity["quick_check_ok"], Value::Bool(true));
    assert_eq!(as_array(&integrity, "rank_violations").len(), 0);
}

#[test]
fn category_list_stats_and_clear() {
    let dir = unique_temp_dir("palate-cli-category");
    let db = dir.join("palate.sqlite3");
    for (index, id) in ["a", "b", "c"].into_iter().enumerate() {
        let created_at = format!("2024-01-0{}T12:00:00Z", index + 1);
        run_json([
            "--db",
            path_str(&db),
            "item",
            "add",
            "--category",
            "wine",
            "--name",
            id,
            "--id",
            id,
            "--created-at",
            created_at.as_str(),
            "--rank",
            "1",
        ]);
    }
    run_json([
        "--db", path_str(&db), "item", "add", "--category", "Beer", "--name", "Stout", "--rank",
        "1",
    ]);

    let listed = run_json(["--db", path_str(&db), "category", "list"]);
    let categories = as_array(&listed, "categories");
    assert_eq!(categories.len(), 2);
    assert_eq!(as_str(&categories[0], "category"), "beer");
    assert_eq!(as_u64(&categories[1], "total_items"), 3);

    let stats = run_json(["--db", path_str(&db), "category", "stats", "--category", "wine"]);
    assert_eq!(as_u64(&stats, "total_items"), 3);
    assert_eq!(as_str(&stats["top_item"], "id"), "c");
    assert_eq!(as_str(&stats, "average_display_score"), "9.5");
    let recent = as_array(&stats, "recent_items")
        .iter()
        .map(|item| as_str(item, "id").to_string())
        .collect::<Vec<_>>();
    assert_eq!(recent, vec!["c", "b", "a"]);

    let cleared = run_json(["--db", path_str(&db), "category", "clear", "--category", "wine"]);
    assert_eq!(as_u64(&cleared, "removed"), 3);
    let after = run_json(["--db", path_str(&db), "category", "list"]);
    assert_eq!(as_array(&after, "categories").len(), 1);
}

#[test]
fn score_command_follows_the_curve() {
    let top = run_json(["score", "--rank", "1", "--total", "10"]);
    assert!((as_f64(&top, "score") - 10.0).abs() < f64::EPSILON);
    assert_eq!(as_str(&top, "tier"), "exceptional");

    let mid = run_json(["score", "--rank", "18", "--total", "30"]);
    assert_eq!(as_str(&mid, "display_score"), "5.3");
    assert_eq!(as_str(&mid, "tier"), "decent");

    let stderr = run_failure(["score", "--rank", "0", "--total", "10"]);
    assert!(stderr.contains("MUST be within"), "unexpected stderr: {stderr}");
    run_failure(["score", "--rank", "11", "--total", "10"]);
}

#[test]
fn export_import_round_trip_between_databases() {
    let dir = unique_temp_dir("palate-cli-snapshot");
    let source = dir.join("source.sqlite3");
    let target = dir.join("target.sqlite3");
    let snapshot = dir.join("snapshot");
    for (index, id) in ["a", "b", "c"].into_iter().enumerate() {
        add_at_rank(&source, id, id, u32::try_from(index + 1).unwrap_or(u32::MAX));
    }

    let exported = run_json(["--db", path_str(&source), "db", "export", "--out", path_str(&snapshot)]);
    let files = as_array(&exported["manifest"], "files");
    assert_eq!(as_u64(&files[0], "records"), 3);
    assert_eq!(as_str(&files[0], "sha256").len(), 64);

    let imported = run_json(["--db", path_str(&target), "db", "import", "--in", path_str(&snapshot)]);
    assert_eq!(as_u64(&imported["summary"], "imported_items"), 3);
    assert_eq!(listed_ids(&target, "wine"), vec!["a", "b", "c"]);

    let repeated =
        run_json(["--db", path_str(&target), "db", "import", "--in", path_str(&snapshot)]);
    assert_eq!(as_u64(&repeated["summary"], "skipped_existing_items"), 3);

    let stderr = run_failure([
        "--db",
        path_str(&target),
        "db",
        "import",
        "--in",
        path_str(&snapshot),
        "--skip-existing",
        "false",
    ]);
    assert!(stderr.contains("already exists"), "unexpected stderr: {stderr}");
}

#[test]
fn backup_and_restore_database_file() {
    let dir = unique_temp_dir("palate-cli-backup");
    let db = dir.join("palate.sqlite3");
    let backup = dir.join("backups").join("palate.bak");
    add_at_rank(&db, "a", "a", 1);

    let backed_up =
        run_json(["--db", path_str(&db), "db", "backup", "--out", path_str(&backup)]);
    assert_eq!(as_str(&backed_up, "status"), "ok");

    add_at_rank(&db, "b", "b", 1);
    assert_eq!(listed_ids(&db, "wine"), vec!["b", "a"]);

    let restored = run_json(["--db", path_str(&db), "db", "restore", "--in", path_str(&backup)]);
    assert_eq!(as_u64(&restored, "current_version"), 1);
    assert_eq!(listed_ids(&db, "wine"), vec!["a"]);
}

#[test]
fn invalid_inputs_fail_closed() {
    let dir = unique_temp_dir("palate-cli-invalid");
    let db = dir.join("palate.sqlite3");

    let stderr = run_failure([
        "--db", path_str(&db), "item", "add", "--category", "wine", "--name", "x", "--rank", "2",
    ]);
    assert!(stderr.contains("invalid rank 2"), "unexpected stderr: {stderr}");

    let stderr = run_failure([
        "--db", path_str(&db), "item", "add", "--category", "red wine", "--name", "x", "--rank",
        "1",
    ]);
    assert!(stderr.contains("invalid category"), "unexpected stderr: {stderr}");

    let stderr = run_failure([
        "--db", path_str(&db), "item", "add", "--category", "wine", "--name", " ", "--rank", "1",
    ]);
    assert!(stderr.contains("name MUST be provided"), "unexpected stderr: {stderr}");

    let listed = run_json(["--db", path_str(&db), "item", "list", "--category", "wine"]);
    assert!(as_array(&listed, "items").is_empty());
}
