use std::process::Command;

use serde_json::json;
use tempfile::tempdir;

use query_harness::scrubber::LAST_SCRUB_TIME_KEY;
use query_harness::state::{GlobalState, SqliteGlobalState};

fn qharness() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_qharness"));
    command.env_remove("RUST_LOG");
    command
}

#[test]
fn history_list_prints_one_line_per_item() {
    let dir = tempdir().unwrap();
    let save_dir = dir.path().join("queries/find-bugs.ql-1");
    std::fs::create_dir_all(&save_dir).unwrap();
    let history = dir.path().join("workspace-query-history.json");
    let doc = json!({
        "version": 2,
        "queries": [
            {
                "t": "local",
                "initialInfo": {
                    "queryPath": "/work/find-bugs.ql",
                    "databaseInfo": { "name": "java-db", "databaseUri": "file:///dbs/java-db" },
                    "start": "2024-05-06T07:08:09Z",
                    "id": "find-bugs.ql-1",
                },
                "completedQuery": {
                    "query": { "querySaveDir": save_dir, "dbItemPath": "/dbs/java-db" },
                    "message": "finished in 3 seconds",
                    "successful": true,
                },
            },
            {
                "t": "variant-analysis",
                "status": "Failed",
                "variantAnalysis": { "id": 42, "query": { "name": "sql-injection" } },
            },
        ],
    });
    std::fs::write(&history, doc.to_string()).unwrap();

    let output = qharness()
        .args(["history", "list", "--file"])
        .arg(&history)
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).unwrap();
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(
        lines,
        [
            "local\tfind-bugs.ql-1\tCompleted\tfind-bugs.ql on java-db - finished in 3 seconds",
            "variant-analysis\t42\tFailed\tsql-injection",
        ]
    );
}

#[test]
fn history_list_on_missing_file_is_empty() {
    let dir = tempdir().unwrap();
    let history = dir.path().join("absent.json");

    let output = qharness()
        .args(["history", "list", "--file"])
        .arg(&history)
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.starts_with("no history in "));
}

#[test]
fn history_scrub_removes_expired_directories() {
    let dir = tempdir().unwrap();
    let queries = dir.path().join("queries");
    let expired = queries.join("old");
    let fresh = queries.join("new");
    std::fs::create_dir_all(&expired).unwrap();
    std::fs::create_dir_all(&fresh).unwrap();
    std::fs::write(expired.join("timestamp"), "0").unwrap();
    let now_ms = chrono::Utc::now().timestamp_millis();
    std::fs::write(fresh.join("timestamp"), now_ms.to_string()).unwrap();

    let output = qharness()
        .args(["history", "scrub", "--ttl-days", "1", "--dir"])
        .arg(&queries)
        .arg("--state")
        .arg(dir.path().join("global-state.sqlite"))
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let stdout = String::from_utf8(output.stdout).unwrap();
    assert_eq!(stdout.trim(), "deleted 1 directories; kept 1");
    assert!(!expired.exists());
    assert!(fresh.exists());
}

#[tokio::test]
async fn history_scrub_runs_even_when_last_run_is_in_the_future() {
    let dir = tempdir().unwrap();
    let queries = dir.path().join("queries");
    let unmarked = queries.join("unmarked");
    std::fs::create_dir_all(&unmarked).unwrap();
    let state_path = dir.path().join("global-state.sqlite");
    let future = chrono::Utc::now().timestamp_millis() + 24 * 60 * 60 * 1000;
    {
        let state = SqliteGlobalState::new(&state_path).unwrap();
        state.set(LAST_SCRUB_TIME_KEY, json!(future)).await.unwrap();
    }

    let output = qharness()
        .args(["history", "scrub", "--dir"])
        .arg(&queries)
        .arg("--state")
        .arg(&state_path)
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let stdout = String::from_utf8(output.stdout).unwrap();
    assert_eq!(stdout.trim(), "deleted 1 directories; kept 0");
    assert!(!unmarked.exists());

    let state = SqliteGlobalState::new(&state_path).unwrap();
    let last = state.get(LAST_SCRUB_TIME_KEY).await.unwrap().unwrap();
    assert!(last.as_i64().unwrap() < future);
}

#[test]
fn run_with_unreadable_query_fails_before_starting_a_server() {
    let dir = tempdir().unwrap();
    let database = dir.path().join("java-db");
    std::fs::create_dir_all(database.join("db-java")).unwrap();
    std::fs::write(database.join("db-java/semmlecode.dbscheme"), "schema").unwrap();
    let history = dir.path().join("history.json");

    let output = qharness()
        .args(["run", "--query"])
        .arg(dir.path().join("missing.ql"))
        .arg("--database")
        .arg(&database)
        .arg("--query-schema")
        .arg(database.join("db-java/semmlecode.dbscheme"))
        .arg("--server")
        .arg(dir.path().join("no-such-server"))
        .arg("--history")
        .arg(&history)
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("cannot read query"), "{stderr}");
    assert!(stderr.contains("missing.ql"), "{stderr}");
    assert!(!history.exists());
}
