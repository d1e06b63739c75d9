#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use rusqlite::Connection;
use serde_json::Value;
use ulid::Ulid;

fn karma_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_karma") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/karma");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "karma-cli", "--bin", "karma"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build karma binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

fn temp_db_path(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("karma-cli-{label}-{}.sqlite3", Ulid::new()))
}

fn karma_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(karma_binary_path());
    command
        .env_remove("KARMA_RELAY_URL")
        .env_remove("KARMA_CONFIG")
        .env_remove("RUST_LOG")
        .arg("--db")
        .arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run karma command {:?}: {err}", args),
    }
}

fn karma_ok(db_path: &Path, args: &[&str]) -> Value {
    let output = karma_output(db_path, args);
    assert!(
        output.status.success(),
        "command {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    stdout_json(&output)
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn register(db_path: &Path, wizard_id: &str) {
    let wizard = karma_ok(
        db_path,
        &[
            "wizard",
            "register",
            "--wizard-id",
            wizard_id,
            "--display-name",
            "Test Wizard",
        ],
    );
    assert_eq!(wizard["karma_score"], 0);
    assert_eq!(wizard["karma_rank"], "E_RANK");
}

fn cleanup(db_path: &Path) {
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{suffix}", db_path.display()));
    }
}

#[test]
fn help_lists_expected_subcommands() {
    let output = match Command::new(karma_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in [
        "wizard",
        "award",
        "daily-bonus",
        "ledger",
        "notifications",
        "ranks",
        "leaderboard",
        "audit",
    ] {
        assert!(stdout.contains(required), "missing subcommand {required}");
    }
}

#[test]
fn lost_item_return_promotes_to_d_rank() {
    let db_path = temp_db_path("promote");
    register(&db_path, "wiz-1");

    let _ = karma_ok(
        &db_path,
        &["award", "--wizard-id", "wiz-1", "--reason", "sell_item"],
    );
    let outcome = karma_ok(
        &db_path,
        &[
            "award",
            "--wizard-id",
            "wiz-1",
            "--reason",
            "return_lost_item",
            "--reference-id",
            "lost-item-42",
        ],
    );

    assert_eq!(outcome["delta"], 50);
    assert_eq!(outcome["new_score"], 60);
    assert_eq!(outcome["new_rank"], "D_RANK");
    assert_eq!(outcome["rank_changed"], true);
    assert_eq!(outcome["dispatched"], false);
    assert_eq!(outcome["entry"]["reference_id"], "lost-item-42");

    let pending = karma_ok(&db_path, &["notifications", "pending"]);
    let rows = pending.as_array().cloned().unwrap_or_default();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|row| row["status"] == "pending"));

    let shown = karma_ok(&db_path, &["wizard", "show", "--wizard-id", "wiz-1"]);
    assert_eq!(shown["wizard"]["karma_score"], 60);
    assert_eq!(shown["progress"]["next_rank"], "C_RANK");
    assert_eq!(shown["progress"]["points_to_next"], 90);

    let ledger = karma_ok(&db_path, &["ledger", "list", "--wizard-id", "wiz-1"]);
    assert_eq!(ledger.as_array().map(Vec::len), Some(2));

    cleanup(&db_path);
}

#[test]
fn daily_bonus_is_idempotent_within_a_day() {
    let db_path = temp_db_path("daily");
    register(&db_path, "wiz-1");

    let first = karma_ok(
        &db_path,
        &[
            "daily-bonus",
            "--wizard-id",
            "wiz-1",
            "--at",
            "2026-02-07T08:00:00Z",
        ],
    );
    let second = karma_ok(
        &db_path,
        &[
            "daily-bonus",
            "--wizard-id",
            "wiz-1",
            "--at",
            "2026-02-07T20:00:00Z",
        ],
    );

    assert_eq!(first["granted"], true);
    assert_eq!(first["day"], "2026-02-07");
    assert_eq!(first["award"]["new_score"], 1);
    assert_eq!(second["granted"], false);
    assert!(second["award"].is_null());

    let shown = karma_ok(&db_path, &["wizard", "show", "--wizard-id", "wiz-1"]);
    assert_eq!(shown["wizard"]["karma_score"], 1);

    cleanup(&db_path);
}

#[test]
fn unknown_wizard_and_reason_fail_with_clear_errors() {
    let db_path = temp_db_path("errors");
    register(&db_path, "wiz-1");

    let missing = karma_output(
        &db_path,
        &[
            "award",
            "--wizard-id",
            "nonexistent-user",
            "--reason",
            "daily_login",
        ],
    );
    assert!(!missing.status.success());
    assert!(String::from_utf8_lossy(&missing.stderr).contains("wizard not found"));

    let bad_reason = karma_output(
        &db_path,
        &["award", "--wizard-id", "wiz-1", "--reason", "stole_item"],
    );
    assert!(!bad_reason.status.success());
    assert!(String::from_utf8_lossy(&bad_reason.stderr).contains("invalid reason code"));

    let zero = karma_output(
        &db_path,
        &[
            "award",
            "--wizard-id",
            "wiz-1",
            "--reason",
            "sell_item",
            "--delta",
            "0",
        ],
    );
    assert!(!zero.status.success());

    let negative_login = karma_output(
        &db_path,
        &[
            "award",
            "--wizard-id",
            "wiz-1",
            "--reason",
            "daily_login",
            "--delta",
            "-5",
        ],
    );
    assert!(!negative_login.status.success());
    assert!(String::from_utf8_lossy(&negative_login.stderr).contains("invalid delta"));

    let ledger = karma_ok(&db_path, &["ledger", "list", "--wizard-id", "wiz-1"]);
    assert_eq!(ledger.as_array().map(Vec::len), Some(0));

    cleanup(&db_path);
}

#[test]
fn negative_delta_clamps_and_produces_no_notification() {
    let db_path = temp_db_path("clamp");
    register(&db_path, "wiz-1");

    let _ = karma_ok(
        &db_path,
        &["award", "--wizard-id", "wiz-1", "--reason", "buy_item"],
    );
    let outcome = karma_ok(
        &db_path,
        &[
            "award",
            "--wizard-id",
            "wiz-1",
            "--reason",
            "sell_item",
            "--delta",
            "-20",
        ],
    );
    assert_eq!(outcome["new_score"], 0);
    assert!(outcome["notification"].is_null());

    cleanup(&db_path);
}

#[test]
fn unreachable_relay_leaves_failed_notification() {
    let db_path = temp_db_path("relay");
    register(&db_path, "wiz-1");

    let relay_addr = {
        let listener = match std::net::TcpListener::bind("127.0.0.1:0") {
            Ok(value) => value,
            Err(err) => panic!("failed to bind probe listener: {err}"),
        };
        match listener.local_addr() {
            Ok(value) => value,
            Err(err) => panic!("failed to read probe address: {err}"),
        }
    };
    let relay_url = format!("http://{relay_addr}/events");

    let outcome = karma_ok(
        &db_path,
        &[
            "--relay-url",
            &relay_url,
            "--relay-timeout-ms",
            "500",
            "award",
            "--wizard-id",
            "wiz-1",
            "--reason",
            "five_star_rating",
        ],
    );
    assert_eq!(outcome["new_score"], 10);
    assert_eq!(outcome["dispatched"], false);

    let pending = karma_ok(&db_path, &["notifications", "pending"]);
    let rows = pending.as_array().cloned().unwrap_or_default();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["status"], "failed");
    assert_eq!(rows[0]["event"]["kind"], "karma_earned");

    cleanup(&db_path);
}

#[test]
fn config_file_overrides_reason_amounts() {
    let db_path = temp_db_path("config");
    let config_path =
        std::env::temp_dir().join(format!("karma-cli-config-{}.json", Ulid::new()));
    let config = serde_json::json!({
        "config_version": 1,
        "rank_table": {
            "thresholds": [
                {"rank": "E_RANK", "min_score": 0},
                {"rank": "D_RANK", "min_score": 50},
                {"rank": "C_RANK", "min_score": 150},
                {"rank": "B_RANK", "min_score": 400},
                {"rank": "A_RANK", "min_score": 1000},
                {"rank": "S_RANK", "min_score": 2500},
                {"rank": "NATIONAL_RANK", "min_score": 5000},
                {"rank": "SHADOW_MONARCH", "min_score": 10000}
            ]
        },
        "reason_amounts": {
            "daily_login": 1,
            "return_lost_item": 75,
            "sell_item": 10,
            "buy_item": 5,
            "five_star_rating": 10
        },
        "day_offset_minutes": 0
    });
    if let Err(err) = std::fs::write(&config_path, config.to_string()) {
        panic!("failed to write config: {err}");
    }
    let config_arg = config_path.display().to_string();

    register(&db_path, "wiz-1");
    let outcome = karma_ok(
        &db_path,
        &[
            "--config",
            &config_arg,
            "award",
            "--wizard-id",
            "wiz-1",
            "--reason",
            "return_lost_item",
        ],
    );
    assert_eq!(outcome["delta"], 75);
    assert_eq!(outcome["new_rank"], "D_RANK");

    let _ = std::fs::remove_file(&config_path);
    cleanup(&db_path);
}

#[test]
fn ranks_and_leaderboard_render_json() {
    let db_path = temp_db_path("board");
    register(&db_path, "wiz-a");
    register(&db_path, "wiz-b");
    let _ = karma_ok(
        &db_path,
        &["award", "--wizard-id", "wiz-b", "--reason", "return_lost_item"],
    );

    let ranks = karma_ok(&db_path, &["ranks", "--json"]);
    let ranks = ranks.as_array().cloned().unwrap_or_default();
    assert_eq!(ranks.len(), 8);
    assert_eq!(ranks[7]["rank"], "SHADOW_MONARCH");
    assert_eq!(ranks[7]["min_score"], 10_000);

    let board = karma_ok(&db_path, &["leaderboard", "--json", "--limit", "5"]);
    let board = board.as_array().cloned().unwrap_or_default();
    assert_eq!(board.len(), 2);
    assert_eq!(board[0]["wizard_id"], "wiz-b");

    cleanup(&db_path);
}

#[test]
fn audit_exits_non_zero_on_tampered_rank() {
    let db_path = temp_db_path("audit");
    register(&db_path, "wiz-1");
    let _ = karma_ok(
        &db_path,
        &["award", "--wizard-id", "wiz-1", "--reason", "sell_item"],
    );

    let healthy = karma_ok(&db_path, &["audit", "--json"]);
    assert_eq!(healthy["healthy"], true);
    assert_eq!(healthy["contract_version"], "karma_audit.v1");

    {
        let conn = match Connection::open(&db_path) {
            Ok(value) => value,
            Err(err) => panic!("failed to open db for tampering: {err}"),
        };
        if let Err(err) = conn.execute(
            "UPDATE wizards SET karma_rank = 'A_RANK' WHERE wizard_id = 'wiz-1'",
            [],
        ) {
            panic!("failed to tamper with rank: {err}");
        }
    }

    let output = karma_output(&db_path, &["audit", "--json"]);
    assert!(!output.status.success());
    let report = stdout_json(&output);
    assert_eq!(report["healthy"], false);
    assert_eq!(report["issues"][0]["code"], "rank_mismatch");

    cleanup(&db_path);
}
