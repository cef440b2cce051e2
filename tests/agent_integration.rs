//! Integration tests for the hostward agent
//!
//! These drive the library API end to end: executing and scheduling tasks
//! against the shared stores, evaluating queries over cached results, and
//! the `hostward` binary for config validation and one-off runs.

use hostward::config::{Configs, TaskConfig, TaskKind};
use hostward::host::StaticHost;
use hostward::query;
use hostward::Agent;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command;

fn agent_with(configs: Configs) -> Agent {
    Agent::new(configs)
        .unwrap()
        .with_host_info(Arc::new(StaticHost::new("h1", BTreeMap::new())))
}

fn envelope(agent: &Agent, path: &str) -> Value {
    serde_json::from_slice(&agent.get_run_by_path(path).expect("envelope cached")).unwrap()
}

#[tokio::test]
async fn test_execute_then_get_returns_output() {
    let agent = agent_with(Configs::default());
    let config = TaskConfig::new(TaskKind::Collector, "/stuff", "Shell")
        .with_field("command", json!("echo integration"));

    let output = agent.execute(&config).await.unwrap();
    let first = agent.get_run_by_path("/r/stuff").unwrap();
    let second = agent.get_run_by_path("/r/stuff").unwrap();
    assert_eq!(first, second);

    let cached: Value = serde_json::from_slice(&first).unwrap();
    assert_eq!(cached["Data"], serde_json::from_slice::<Value>(&output).unwrap());
    assert!(cached["Data"]["Output"]
        .as_str()
        .unwrap()
        .contains("integration"));
    assert_eq!(cached["Data"]["ExitStatus"], 0);
}

#[tokio::test]
async fn test_collector_feeds_shipper_dependencies() {
    let receiver = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/ingest", receiver.local_addr().unwrap());
    let received = Arc::new(tokio::sync::Mutex::new(Vec::<Value>::new()));
    let sink = Arc::clone(&received);
    let app = axum::Router::new().route(
        "/ingest",
        axum::routing::post(move |axum::Json(body): axum::Json<Value>| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().await.push(body);
                "ok"
            }
        }),
    );
    tokio::spawn(async move { axum::serve(receiver, app).await });

    let agent = agent_with(Configs::default());
    let collector = TaskConfig::new(TaskKind::Collector, "/greeting", "Shell")
        .with_field("command", json!("echo hello"));
    agent.execute(&collector).await.unwrap();

    let shipper = TaskConfig::new(TaskKind::Shipper, "/out", "Http")
        .with_field("url", json!(url))
        .with_dependencies(["/greeting", "/absent"]);
    agent.execute(&shipper).await.unwrap();

    let bodies = received.lock().await;
    assert_eq!(bodies.len(), 1);
    let shipped = bodies[0].as_object().unwrap();
    assert_eq!(shipped.len(), 1);
    assert_eq!(shipped["/r/greeting"]["Path"], "/greeting");

    let record = envelope(&agent, "/w/out");
    assert_eq!(record["Data"]["StatusCode"], 200);
}

#[tokio::test]
async fn test_hundred_scheduled_tasks_share_stores() {
    let agent = agent_with(Configs::default());
    let tasks: Vec<_> = (0..100)
        .map(|i| {
            let config = TaskConfig::new(TaskKind::Executor, &format!("/stress/{}", i), "Shell")
                .with_field("command", json!(format!("echo {}", i)))
                .with_interval(Duration::from_millis(20));
            agent.schedule(config)
        })
        .collect();

    let all_written = || (0..100).all(|i| agent.get_run_by_path(&format!("/x/stress/{}", i)).is_some());
    for _ in 0..500 {
        if all_written() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    for task in &tasks {
        task.cancel();
    }
    for task in tasks {
        task.join().await;
    }

    for i in 0..100 {
        let path = format!("/x/stress/{}", i);
        let record = envelope(&agent, &path);
        assert_eq!(record["Path"], path.trim_start_matches("/x"));
        assert_eq!(record["Data"]["Executed"], true);
        assert!(record["Data"]["Output"]
            .as_str()
            .unwrap()
            .starts_with(&i.to_string()));
        assert!(agent.counters().get(&path) >= 1);
    }
}

#[test]
fn test_query_over_cached_results() {
    let agent = agent_with(Configs::default());
    agent
        .cache()
        .set("/r/cpu/load", br#"{"Data":{"Load":2.5}}"#.to_vec());
    let tags = BTreeMap::from([("env".to_string(), "prod".to_string())]);

    assert!(query::evaluate(
        r#"/r/cpu/load.Load > 2 && tags.env == "prod""#,
        &**agent.cache(),
        &tags,
        "h1"
    )
    .unwrap());
    assert!(query::evaluate(r#"hostname == "h1""#, &**agent.cache(), &tags, "h1").unwrap());
    assert!(query::evaluate("/r/missing/path.Load > 0", &**agent.cache(), &tags, "h1").is_err());
}

#[tokio::test]
async fn test_executor_condition_reads_collector_output() {
    let agent = agent_with(Configs::default());
    agent
        .cache()
        .set("/r/cpu/load", br#"{"Data":{"Load":2.5}}"#.to_vec());

    let hot = TaskConfig::new(TaskKind::Executor, "/cool-down", "Shell")
        .with_field("command", json!("echo cooling"))
        .with_field("conditions", json!("/r/cpu/load.Load > 2"));
    agent.execute(&hot).await.unwrap();
    let record = envelope(&agent, "/x/cool-down");
    assert_eq!(record["Data"]["Executed"], true);
    assert_eq!(record["Data"]["Counter"], 1);

    let cold = TaskConfig::new(TaskKind::Executor, "/cool-down", "Shell")
        .with_field("command", json!("echo cooling"))
        .with_field("conditions", json!("/r/cpu/load.Load > 10"));
    agent.execute(&cold).await.unwrap();
    let record = envelope(&agent, "/x/cool-down");
    assert_eq!(record["Data"]["Executed"], false);
    assert_eq!(agent.counters().get("/x/cool-down"), 0);
}

#[tokio::test]
async fn test_access_control_from_config() {
    let mut configs = Configs::default();
    configs.access_tokens = vec!["abc".to_string()];
    configs.general.allowed_networks = vec!["127.0.0.0/8".to_string()];
    let agent = agent_with(configs);

    let access = agent.access();
    let local = "127.0.0.1".parse().ok();
    assert!(access.authorize(local, Some("abc")).is_ok());
    assert!(access.authorize(local, Some("abd")).is_err());
    assert!(access.authorize("10.0.0.1".parse().ok(), Some("abc")).is_err());
    assert!(!access.networks.is_allowed("batman"));
}

fn write_config_dir(dir: &Path) {
    fs::write(dir.join("general.yml"), "ttl: 5m\ntags:\n  role: web\n").unwrap();
    fs::create_dir(dir.join("collectors")).unwrap();
    fs::write(
        dir.join("collectors/echo.yml"),
        "path: /echo\nimplementation: Shell\ninterval: 10s\nfields:\n  command: echo 42\n",
    )
    .unwrap();
}

#[tokio::test]
async fn test_cli_validate_config_dir() {
    let temp_dir = TempDir::new().unwrap();
    write_config_dir(temp_dir.path());

    let output = Command::new(env!("CARGO_BIN_EXE_hostward"))
        .arg("--config")
        .arg(temp_dir.path())
        .arg("validate")
        .output()
        .await
        .expect("Failed to run hostward validate");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("1 collectors"));
}

#[tokio::test]
async fn test_cli_rejects_broken_task_config() {
    let temp_dir = TempDir::new().unwrap();
    write_config_dir(temp_dir.path());
    fs::write(
        temp_dir.path().join("collectors/broken.yml"),
        "path: /broken\nimplementation: \"\"\n",
    )
    .unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_hostward"))
        .arg("--config")
        .arg(temp_dir.path())
        .arg("validate")
        .output()
        .await
        .expect("Failed to run hostward validate");

    assert!(!output.status.success());
}

#[tokio::test]
async fn test_cli_run_prints_envelope() {
    let temp_dir = TempDir::new().unwrap();
    write_config_dir(temp_dir.path());

    let output = Command::new(env!("CARGO_BIN_EXE_hostward"))
        .arg("--config")
        .arg(temp_dir.path())
        .arg("--log-level")
        .arg("error")
        .arg("run")
        .arg("collector")
        .arg(temp_dir.path().join("collectors/echo.yml"))
        .output()
        .await
        .expect("Failed to run hostward run");

    assert!(output.status.success());
    let record: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(record["Path"], "/echo");
    assert_eq!(record["Tags"]["role"], "web");
    assert!(record["Data"]["Output"].as_str().unwrap().contains("42"));
}
