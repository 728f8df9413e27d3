//! Kernel lifecycle, configuration validation and management status.

mod common;

use common::{config, manual_assets};
use floor_kernel::kernel::{KernelBuilder, KernelState};
use floor_kernel::{Error, KernelConfig};
use serde_json::json;
use std::time::Duration;

fn builder() -> KernelBuilder {
    KernelBuilder::new(config(json!({
        "assets": manual_assets(),
        "teams": [ { "name": "workers", "source": "worker_pool", "properties": { "size": "1" } } ],
        "offices": [{
            "name": "office",
            "functions": [ { "name": "noop", "function": "noop", "team": "workers" } ]
        }]
    })))
    .function("noop", |_ctx| Ok(()))
}

#[test]
fn test_invoke_requires_open_kernel() {
    let kernel = builder().build().unwrap();
    let office = kernel.office("office").unwrap();

    let err = office.invoke_function("noop", ()).unwrap_err();
    assert!(matches!(err, Error::StateTransition(_)));

    kernel.open_kernel().unwrap();
    let handle = office.invoke_function("noop", ()).unwrap();
    assert!(handle.wait_timeout(Duration::from_secs(2)).unwrap().is_completed());

    kernel.close_kernel();
    assert!(matches!(
        office.invoke_function("noop", ()).unwrap_err(),
        Error::StateTransition(_)
    ));
}

#[test]
fn test_completion_observable_without_runtime_of_its_own() {
    let kernel = builder().build().unwrap();
    kernel.open_kernel().unwrap();

    let handle = kernel.office("office").unwrap().invoke_function("noop", ()).unwrap();
    let outcome = tokio_test::block_on(handle.completed());

    assert!(outcome.is_completed());
    assert!(handle.is_complete());
}

#[test]
fn test_open_is_only_valid_once() {
    let kernel = builder().build().unwrap();
    kernel.open_kernel().unwrap();
    assert!(matches!(kernel.open_kernel().unwrap_err(), Error::StateTransition(_)));

    kernel.close_kernel();
    kernel.close_kernel();
    assert_eq!(kernel.state(), KernelState::Closed);
    assert!(kernel.open_kernel().is_err());
}

#[test]
fn test_lookup_errors() {
    let kernel = builder().build().unwrap();
    kernel.open_kernel().unwrap();

    assert!(matches!(kernel.office("elsewhere").unwrap_err(), Error::NotFound(_)));
    assert!(matches!(
        kernel.office("office").unwrap().invoke_function("missing", ()).unwrap_err(),
        Error::NotFound(_)
    ));
}

#[test]
fn test_invalid_team_configuration_rejected() {
    let err = KernelBuilder::new(config(json!({
        "teams": [ { "name": "workers", "source": "worker_pool", "properties": { "size": "0" } } ]
    })))
    .build()
    .unwrap_err();
    assert!(err.is_configuration());

    let err = KernelBuilder::new(config(json!({
        "offices": [{ "name": "office", "default_team": "nobody" }]
    })))
    .build()
    .unwrap_err();
    assert!(err.is_configuration());
}

#[test]
fn test_config_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kernel.json");
    std::fs::write(
        &path,
        json!({ "offices": [ { "name": "office", "functions": [ { "name": "noop", "function": "noop" } ] } ] })
            .to_string(),
    )
    .unwrap();

    let config = KernelConfig::from_file(&path).unwrap();
    let kernel = KernelBuilder::new(config).function("noop", |_ctx| Ok(())).build().unwrap();
    assert_eq!(kernel.offices().len(), 1);
}

#[test]
fn test_status_reports_teams_offices_and_work() {
    let kernel = builder().build().unwrap();
    assert_eq!(kernel.status().state, KernelState::Built);
    kernel.open_kernel().unwrap();

    let office = kernel.office("office").unwrap();
    for _ in 0..3 {
        let handle = office.invoke_function("noop", ()).unwrap();
        assert!(handle.wait_timeout(Duration::from_secs(2)).unwrap().is_completed());
    }

    let status = kernel.status();
    assert_eq!(status.state, KernelState::Open);
    assert!(status.opened_at.is_some());
    assert_eq!(status.waiting_job_nodes, 0);
    assert_eq!(status.offices[0].processes_started, 3);
    assert_eq!(status.offices[0].processes_completed, 3);
    assert_eq!(status.offices[0].processes_active, 0);

    let names: Vec<_> = status.teams.iter().map(|team| team.name.as_str()).collect();
    assert!(names.contains(&"workers"));
    assert!(names.contains(&"office:passive"));

    let value = serde_json::to_value(&status).unwrap();
    assert_eq!(value["state"], "Open");
    assert_eq!(value["offices"][0]["name"], "office");
}
