//! End-to-end flows through the full load → schedule → handler path

mod common;

use common::{event_log, script_plugin, FixtureProject};
use garden::tasks::NodeStatus;
use garden::{Garden, GardenOpts};
use serde_json::json;

const PROJECT: &str = r#"
kind: Project
name: e2e
environments:
  - name: local
providers:
  - name: script-plugin
"#;

fn unit_test_module(name: &str, build_deps: &[&str]) -> String {
    let deps = build_deps
        .iter()
        .map(|d| format!("    - {}", d))
        .collect::<Vec<_>>()
        .join("\n");
    let build = if build_deps.is_empty() {
        String::new()
    } else {
        format!("build:\n  dependencies:\n{}\n", deps)
    };
    format!(
        r#"kind: Module
type: script
name: {name}
{build}tests:
  - name: unit
    command: [echo, OK]
"#
    )
}

async fn open(project: &FixtureProject, log: common::EventLog) -> Garden {
    Garden::open(
        project.root(),
        GardenOpts {
            plugins: vec![script_plugin(log)],
            ..Default::default()
        },
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn build_and_test_a_dependency_chain() {
    let project = FixtureProject::new(PROJECT);
    project.add_module("a", &unit_test_module("a", &[]));
    project.add_module("b", &unit_test_module("b", &["a"]));
    project.add_module("c", &unit_test_module("c", &["b"]));

    let log = event_log();
    let garden = open(&project, log.clone()).await;
    let result = garden.test(None, None, true, true).await.unwrap();

    assert!(result.succeeded(), "{}", result.summary());

    for module in ["a", "b", "c"] {
        let build = result.get(&format!("build.{}", module)).unwrap();
        assert_eq!(build.status, NodeStatus::Complete);
        assert_eq!(build.output.as_ref().unwrap()["fresh"], json!(true));

        let test = result.get(&format!("test.{}.unit", module)).unwrap();
        assert_eq!(test.status, NodeStatus::Complete);
        assert_eq!(test.output.as_ref().unwrap()["success"], json!(true));
        assert_eq!(test.output.as_ref().unwrap()["log"], json!("OK"));
    }

    // Every build.x completes before test.x.unit starts
    let events = log.lock().unwrap().clone();
    for module in ["a", "b", "c"] {
        let build_at = events
            .iter()
            .position(|e| e == &format!("build.{}", module))
            .unwrap();
        let test_at = events
            .iter()
            .position(|e| e == &format!("test.{}.unit", module))
            .unwrap();
        assert!(build_at < test_at, "events: {:?}", events);
    }
}

#[tokio::test]
async fn builds_are_memoized_and_freshness_reported() {
    let project = FixtureProject::new(PROJECT);
    project.add_module("a", &unit_test_module("a", &[]));

    let log = event_log();
    let garden = open(&project, log.clone()).await;

    let first = garden.build(None, false).await.unwrap();
    assert_eq!(
        first.get("build.a").unwrap().output.as_ref().unwrap()["fresh"],
        json!(true)
    );

    // Second run: result cache hit, the handler is not invoked again
    let second = garden.build(None, false).await.unwrap();
    assert!(second.get("build.a").unwrap().cached);
    let events = log.lock().unwrap().clone();
    assert_eq!(events.iter().filter(|e| *e == "build.a").count(), 1);
}

#[tokio::test]
async fn test_name_glob_filters_which_tests_run() {
    let project = FixtureProject::new(PROJECT);
    project.add_module(
        "a",
        r#"kind: Module
type: script
name: a
tests:
  - name: unit
    command: [echo, OK]
  - name: integration
    command: [echo, OK]
"#,
    );
    project.add_module(
        "c",
        r#"kind: Module
type: script
name: c
tests:
  - name: unit
    command: [echo, OK]
  - name: integ
    command: [echo, OK]
"#,
    );

    let log = event_log();
    let garden = open(&project, log).await;
    let result = garden.test(None, Some("int*"), true, false).await.unwrap();

    assert!(result.succeeded(), "{}", result.summary());
    assert!(result.get("test.a.integration").is_some());
    assert!(result.get("test.c.integ").is_some());
    assert!(result.get("test.a.unit").is_none());
    assert!(result.get("test.c.unit").is_none());
}

#[tokio::test]
async fn local_module_with_copy_build_dependency_fails_load() {
    let project = FixtureProject::new(PROJECT);
    project.add_module("lib", &unit_test_module("lib", &[]));
    project.add_module(
        "app",
        r#"kind: Module
type: script
name: app
local: true
build:
  dependencies:
    - name: lib
      copy:
        - source: dist
          target: vendor
"#,
    );

    let err = Garden::open(
        project.root(),
        GardenOpts {
            plugins: vec![script_plugin(event_log())],
            ..Default::default()
        },
    )
    .await
    .unwrap_err();

    let text = err.to_string();
    assert!(text.contains("may not declare `copy`"), "{text}");
    assert!(text.contains("lib"), "{text}");
}

#[tokio::test]
async fn unresolved_runtime_reference_names_service_and_expression() {
    let project = FixtureProject::new(PROJECT);
    project.add_module(
        "a",
        r#"kind: Module
type: script
name: a
spec:
  services:
    - name: service-b
    - name: service-a
      dependencies: [service-b]
      foo: "${runtime.services.service-b.outputs.foo}"
"#,
    );

    let garden = open(&project, event_log()).await;
    let result = garden
        .deploy(Some(&["service-a".to_string()]), true, false)
        .await
        .unwrap();

    let failed = result.get("deploy.service-a").unwrap();
    assert_eq!(failed.status, NodeStatus::Failed);
    assert!(
        failed.error.as_ref().unwrap().contains(
            "Unable to resolve one or more runtime template values for service 'service-a': \
             ${runtime.services.service-b.outputs.foo}"
        ),
        "{:?}",
        failed.error
    );
}

#[tokio::test]
async fn service_outputs_flow_into_dependent_deploys() {
    let project = FixtureProject::new(PROJECT);
    project.add_module(
        "a",
        r#"kind: Module
type: script
name: a
spec:
  services:
    - name: service-b
      outputs:
        foo: bar
    - name: service-a
      dependencies: [service-b]
      foo: "${runtime.services.service-b.outputs.foo}"
"#,
    );

    let garden = open(&project, event_log()).await;
    let result = garden
        .deploy(Some(&["service-a".to_string()]), true, false)
        .await
        .unwrap();
    assert!(result.succeeded(), "{}", result.summary());
    assert_eq!(
        result.get("deploy.service-b").unwrap().output.as_ref().unwrap()["outputs"]["foo"],
        json!("bar")
    );
}

#[tokio::test]
async fn failing_test_skips_nothing_else_but_reports_failure() {
    let project = FixtureProject::new(PROJECT);
    project.add_module(
        "a",
        r#"kind: Module
type: script
name: a
tests:
  - name: unit
    command: [sh, -c, "exit 1"]
"#,
    );
    project.add_module("b", &unit_test_module("b", &[]));

    let garden = open(&project, event_log()).await;
    let result = garden.test(None, None, true, true).await.unwrap();

    assert!(!result.succeeded());
    assert_eq!(
        result.get("test.a.unit").unwrap().status,
        NodeStatus::Failed
    );
    // Independent module's test still ran
    assert_eq!(
        result.get("test.b.unit").unwrap().status,
        NodeStatus::Complete
    );
}

#[tokio::test]
async fn task_outputs_are_exposed_to_dependent_tests() {
    let project = FixtureProject::new(PROJECT);
    project.add_module(
        "a",
        r#"kind: Module
type: script
name: a
tasks:
  - name: seed
    command: [echo, seeded]
tests:
  - name: uses-seed
    dependencies: [seed]
    command: [sh, -c, "echo $GARDEN_TASK_SEED_OUTPUT_LOG"]
"#,
    );

    let garden = open(&project, event_log()).await;
    let result = garden.test(None, None, true, false).await.unwrap();
    assert!(result.succeeded(), "{}", result.summary());
    assert_eq!(
        result.get("test.a.uses-seed").unwrap().output.as_ref().unwrap()["log"],
        json!("seeded")
    );
}
