//! End-to-end jobs against in-memory SQLite.

use std::collections::HashMap;

use querylens_core::serializer;
use querylens_worker::runner::ScriptSource;
use querylens_worker::{HarnessConfig, JobInput, JobOrchestrator, JobPhase};

const SCHEMA: &str = r#"
model Team {
  id      Int      @id @default(autoincrement())
  name    String   @unique
  drivers Driver[]
}

model Driver {
  id     Int    @id @default(autoincrement())
  name   String
  wins   Int    @default(0)
  team   Team?  @relation(fields: [teamId], references: [id])
  teamId Int?
}
"#;

fn config(vars: &[(&str, &str)]) -> HarnessConfig {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    HarnessConfig::from_lookup(|name| vars.get(name).cloned()).unwrap()
}

async fn run_job(config: &HarnessConfig, script: &str) -> (JobOrchestrator, serde_json::Value) {
    let mut job = JobOrchestrator::new(config);
    let result = job
        .run(JobInput::new(SCHEMA, ScriptSource::new("transaction.rhai", script)))
        .await;
    let artifact = serializer::serialize_result(&result);
    (job, serde_json::from_str(&artifact).unwrap())
}

#[tokio::test(flavor = "multi_thread")]
async fn driver_scenario_reports_inserts_selects_and_output() {
    let script = r#"
fn run(db) {
    for name in ["Lewis", "Max", "Charles", "Lando"] {
        db.create("Driver", #{ name: name });
    }
    let rows = db.query("SELECT name FROM Driver ORDER BY id");
    for row in rows {
        print(row.name);
    }
}
"#;
    let (job, artifact) = run_job(&config(&[]), script).await;

    assert_eq!(job.phase(), JobPhase::Done);
    assert!(artifact.get("error").is_none(), "{artifact}");
    assert_eq!(artifact["output"], "Lewis\nMax\nCharles\nLando");

    let queries = artifact["queries"].as_array().unwrap();
    assert_eq!(queries.len(), 5);
    for insert in &queries[..4] {
        assert!(insert["sql"].as_str().unwrap().starts_with("INSERT INTO \"Driver\""));
        assert_eq!(insert["line_number"], 4);
        assert_eq!(insert["source_context"], "db.create(\"Driver\", #{ name: name });");
    }
    assert!(queries[0]["sql"].as_str().unwrap().contains("'Lewis'"));
    assert_eq!(queries[4]["sql"], "SELECT name FROM Driver ORDER BY id");
    assert_eq!(queries[4]["line_number"], 6);
    assert!(queries.iter().all(|q| q["time"].as_f64().unwrap() >= 0.0));
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_entry_point_is_an_empty_job() {
    let (job, artifact) = run_job(&config(&[]), "let x = 1;\nprint(\"loaded\");\n").await;

    assert_eq!(job.phase(), JobPhase::Done);
    assert_eq!(artifact["output"], "");
    assert_eq!(artifact["queries"], serde_json::json!([]));
    assert!(artifact.get("error").is_none());
    assert!(artifact.get("returned").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn throw_keeps_partial_output_and_queries() {
    let script = r#"
fn run(db) {
    print("first");
    db.create("Team", #{ name: "Ferrari" });
    print("second");
    throw "Engine failure";
}
"#;
    let (job, artifact) = run_job(&config(&[]), script).await;

    assert_eq!(job.phase(), JobPhase::Faulted);
    assert_eq!(artifact["output"], "first\nsecond");
    assert_eq!(artifact["queries"].as_array().unwrap().len(), 1);
    assert_eq!(artifact["error"], "Engine failure");
    let traceback = artifact["traceback"].as_str().unwrap();
    assert!(traceback.contains("line 6, in run"), "{traceback}");
}

#[tokio::test(flavor = "multi_thread")]
async fn queries_are_attributed_to_the_issuing_line() {
    let script = r#"
fn add_team(db, name) {
    db.create("Team", #{ name: name })
}

fn run(db) {
    let team = add_team(db, "McLaren");
    db.create("Driver", #{ name: "Lando", teamId: team.id });
    db.count("Driver")
}
"#;
    let (_, artifact) = run_job(&config(&[]), script).await;

    let lines: Vec<i64> = artifact["queries"]
        .as_array()
        .unwrap()
        .iter()
        .map(|q| q["line_number"].as_i64().unwrap())
        .collect();
    assert_eq!(lines, vec![3, 8, 9]);
    assert_eq!(artifact["returned"], "1");
}

#[tokio::test(flavor = "multi_thread")]
async fn raw_statements_inline_their_parameters() {
    let script = r#"
fn run(db) {
    db.execute("INSERT INTO Team (name) VALUES (?)", ["Williams"]);
}
"#;
    let (_, artifact) = run_job(&config(&[]), script).await;
    let query = &artifact["queries"][0];
    assert_eq!(query["sql"], "INSERT INTO Team (name) VALUES ('Williams')");
    assert_eq!(query["template"], "INSERT INTO Team (name) VALUES (?)");
    assert_eq!(query["line_number"], 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_migrate_command_falls_back_to_force_sync() {
    let config = config(&[("HARNESS_MIGRATE_COMMAND", "echo broken >&2; exit 3")]);
    let script = r#"
fn run(db) {
    db.create("Team", #{ name: "Red Bull" });
    db.count("Team")
}
"#;
    let (job, artifact) = run_job(&config, script).await;

    assert_eq!(job.phase(), JobPhase::Done);
    assert!(artifact.get("schema_error").is_none(), "{artifact}");
    assert!(artifact.get("error").is_none(), "{artifact}");
    assert_eq!(artifact["returned"], "1");
}

#[tokio::test(flavor = "multi_thread")]
async fn big_integers_and_structures_are_returned() {
    let script = r#"
fn run() {
    let big = bigint("123456789012345678901234567890");
    #{ total: big * 10, names: ["Lewis", "Max"], nothing: () }
}
"#;
    let (_, artifact) = run_job(&config(&[]), script).await;

    assert_eq!(
        artifact["returned"],
        serde_json::json!({
            "names": ["Lewis", "Max"],
            "nothing": null,
            "total": "1234567890123456789012345678900",
        })
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn module_state_does_not_leak_between_jobs() {
    let script = r#"
let counter = 0;
fn run() {
    "fresh"
}
"#;
    let config = config(&[]);
    let (_, first) = run_job(&config, script).await;
    let (_, second) = run_job(&config, script).await;
    assert_eq!(first["returned"], second["returned"]);
    assert_eq!(first["erd"], second["erd"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn broken_schema_is_reported_but_script_still_runs() {
    let mut job = JobOrchestrator::new(&config(&[]));
    let result = job
        .run(JobInput::new(
            "model Broken {",
            ScriptSource::new("transaction.rhai", r#"fn run() { print("still here"); }"#),
        ))
        .await;

    assert!(result.schema_error.unwrap().starts_with("Schema provisioning failed"));
    assert_eq!(result.output, "still here");
    assert_eq!(result.erd, "");
    assert!(result.error.is_none());
}
