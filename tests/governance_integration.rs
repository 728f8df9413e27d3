//! Governance and administration integration tests.

mod common;

use common::{config, manual_assets, Log};
use floor_kernel::kernel::{
    FnAdministration, FnManagedObjectSource, Fault, Governance, GovernanceContext, GovernanceFactory,
    KernelBuilder, ManagedObject, ValueManagedObject,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

/// Transaction-like governance recording what happened to it.
#[derive(Debug)]
struct Transaction {
    log: Log,
}

impl Governance for Transaction {
    fn govern_managed_object(
        &mut self,
        extension: Arc<dyn Any + Send + Sync>,
        _context: &mut GovernanceContext<'_>,
    ) -> Result<(), Fault> {
        let name = extension.downcast::<&'static str>().map(|n| *n).unwrap_or("?");
        self.log.push(format!("govern:{}", name));
        Ok(())
    }

    fn enforce_governance(&mut self, context: &mut GovernanceContext<'_>) -> Result<(), Fault> {
        self.log.push(format!("enforce:{}", context.governance_name()));
        Ok(())
    }

    fn disregard_governance(&mut self, context: &mut GovernanceContext<'_>) -> Result<(), Fault> {
        self.log.push(format!("disregard:{}", context.governance_name()));
        Ok(())
    }
}

#[derive(Debug)]
struct TransactionFactory {
    log: Log,
}

impl GovernanceFactory for TransactionFactory {
    fn create_governance(&self) -> Box<dyn Governance> {
        self.log.push("activate");
        Box::new(Transaction { log: self.log.clone() })
    }
}

fn build(log: &Log) -> floor_kernel::Kernel {
    let (work_log, fail_log, audit_log) = (log.clone(), log.clone(), log.clone());
    let kernel = KernelBuilder::new(config(json!({
        "assets": manual_assets(),
        "managed_object_sources": [ { "name": "db", "source": "connections" } ],
        "offices": [{
            "name": "office",
            "managed_objects": [ { "name": "conn", "source": "db", "scope": "thread" } ],
            "governance": [ { "name": "tx", "governance": "transaction", "extension": "transactional" } ],
            "functions": [
                {
                    "name": "save",
                    "function": "save",
                    "objects": [ { "object": "conn" } ],
                    "governance": [ "tx" ],
                    "next": "save_again"
                },
                {
                    "name": "save_again",
                    "function": "save",
                    "objects": [ { "object": "conn" } ],
                    "governance": [ "tx" ]
                },
                {
                    "name": "fail",
                    "function": "fail",
                    "objects": [ { "object": "conn" } ],
                    "governance": [ "tx" ]
                },
                {
                    "name": "audited",
                    "function": "save",
                    "objects": [ { "object": "conn" } ],
                    "pre_administration": [
                        { "name": "before", "administration": "audit", "extension": "transactional", "objects": [ "conn" ] }
                    ],
                    "post_administration": [
                        { "name": "after", "administration": "audit", "extension": "transactional", "objects": [ "conn" ] }
                    ]
                },
                { "name": "plain", "function": "save" }
            ]
        }]
    })))
    .managed_object_source(
        "connections",
        Arc::new(FnManagedObjectSource::new(|| {
            Ok(Arc::new(ValueManagedObject::new(1u32).with_extension("transactional", "conn"))
                as Arc<dyn ManagedObject>)
        })),
    )
    .governance("transaction", Arc::new(TransactionFactory { log: log.clone() }))
    .administration(
        "audit",
        Arc::new(FnAdministration::new(move |extensions, context| {
            audit_log.push(format!("{}:{}:{}", context.duty_name(), context.function_name(), extensions.len()));
            Ok(())
        })),
    )
    .function("save", move |ctx| {
        work_log.push(ctx.function_name().to_string());
        Ok(())
    })
    .function("fail", move |_ctx| {
        fail_log.push("fail");
        Err(Fault::application("constraint violated"))
    })
    .build()
    .unwrap();
    kernel.open_kernel().unwrap();
    kernel
}

#[test]
fn test_governance_activates_once_and_enforces_at_thread_end() {
    let log = Log::default();
    let kernel = build(&log);

    let handle = kernel.office("office").unwrap().invoke_function("save", ()).unwrap();

    assert!(handle.wait_timeout(Duration::from_secs(2)).unwrap().is_completed());
    assert_eq!(
        log.entries(),
        vec!["activate", "govern:conn", "save", "save_again", "enforce:tx"]
    );
}

#[test]
fn test_escalation_disregards_active_governance() {
    let log = Log::default();
    let kernel = build(&log);

    let handle = kernel.office("office").unwrap().invoke_function("fail", ()).unwrap();
    let outcome = handle.wait_timeout(Duration::from_secs(2)).unwrap();

    assert_eq!(outcome.fault().unwrap().message(), "constraint violated");
    assert_eq!(log.entries(), vec!["activate", "govern:conn", "fail", "disregard:tx"]);
}

#[test]
fn test_duties_surround_function() {
    let log = Log::default();
    let kernel = build(&log);
    let office = kernel.office("office").unwrap();

    let handle = office.invoke_function("audited", ()).unwrap();

    assert!(handle.wait_timeout(Duration::from_secs(2)).unwrap().is_completed());
    assert_eq!(log.entries(), vec!["before:audited:1", "audited", "after:audited:1"]);
    assert_eq!(office.status().job_nodes_created, 3);
}

#[test]
fn test_function_without_governance_or_duties_is_one_node() {
    let log = Log::default();
    let kernel = build(&log);
    let office = kernel.office("office").unwrap();

    let handle = office.invoke_function("plain", ()).unwrap();

    assert!(handle.wait_timeout(Duration::from_secs(2)).unwrap().is_completed());
    assert_eq!(log.entries(), vec!["plain"]);
    let status = office.status();
    assert_eq!(status.job_nodes_created, 1);
    assert_eq!(status.threads_started, 1);
}

// =============================================================================
// Hooks raising faults and instigating flows
// =============================================================================

/// Governance whose enforcement behaves according to its configured name.
#[derive(Debug)]
struct Ledger {
    log: Log,
}

impl Governance for Ledger {
    fn govern_managed_object(
        &mut self,
        _extension: Arc<dyn Any + Send + Sync>,
        _context: &mut GovernanceContext<'_>,
    ) -> Result<(), Fault> {
        Ok(())
    }

    fn enforce_governance(&mut self, context: &mut GovernanceContext<'_>) -> Result<(), Fault> {
        let name = context.governance_name().to_string();
        self.log.push(format!("enforce:{}", name));
        match name.as_str() {
            "flowing" => context.do_flow("side", ()).map(|_| ()),
            "spawning" => {
                context.do_flow("side", ())?;
                Err(Fault::application("ledger out of balance"))
            }
            _ => Err(Fault::application("ledger rejected")),
        }
    }

    fn disregard_governance(&mut self, context: &mut GovernanceContext<'_>) -> Result<(), Fault> {
        self.log.push(format!("disregard:{}", context.governance_name()));
        Ok(())
    }
}

#[derive(Debug)]
struct LedgerFactory {
    log: Log,
}

impl GovernanceFactory for LedgerFactory {
    fn create_governance(&self) -> Box<dyn Governance> {
        Box::new(Ledger { log: self.log.clone() })
    }
}

fn build_hooks(log: &Log) -> floor_kernel::Kernel {
    let (work_log, side_log, steward_log, recover_log) = (log.clone(), log.clone(), log.clone(), log.clone());
    let kernel = KernelBuilder::new(config(json!({
        "assets": manual_assets(),
        "offices": [{
            "name": "office",
            "governance": [
                {
                    "name": "flowing",
                    "governance": "ledger",
                    "extension": "ledger",
                    "flows": [ { "function": "side" } ]
                },
                {
                    "name": "spawning",
                    "governance": "ledger",
                    "extension": "ledger",
                    "flows": [ { "function": "side", "spawn_thread": true } ]
                },
                {
                    "name": "guarded",
                    "governance": "ledger",
                    "extension": "ledger",
                    "escalations": [ { "fault_type": "Application", "function": "recover" } ]
                }
            ],
            "functions": [
                { "name": "flowing_work", "function": "work", "governance": [ "flowing" ] },
                { "name": "spawning_work", "function": "work", "governance": [ "spawning" ] },
                { "name": "guarded_work", "function": "work", "governance": [ "guarded" ] },
                {
                    "name": "duty_flow",
                    "function": "work",
                    "pre_administration": [{
                        "name": "flow_first",
                        "administration": "steward",
                        "extension": "ledger",
                        "flows": [ { "function": "side" } ]
                    }]
                },
                {
                    "name": "duty_spawn_fail",
                    "function": "work",
                    "pre_administration": [{
                        "name": "spawn_then_fail",
                        "administration": "steward",
                        "extension": "ledger",
                        "flows": [ { "function": "side", "spawn_thread": true } ]
                    }]
                },
                {
                    "name": "duty_guarded",
                    "function": "work",
                    "pre_administration": [{
                        "name": "refuse",
                        "administration": "steward",
                        "extension": "ledger",
                        "escalations": [ { "fault_type": "Application", "function": "recover" } ]
                    }]
                },
                { "name": "implicit", "function": "work" },
                {
                    "name": "explicit",
                    "function": "work",
                    "governance": [],
                    "pre_administration": [],
                    "post_administration": []
                },
                { "name": "side", "function": "side" },
                { "name": "recover", "function": "recover" }
            ]
        }]
    })))
    .governance("ledger", Arc::new(LedgerFactory { log: log.clone() }))
    .administration(
        "steward",
        Arc::new(FnAdministration::new(move |_extensions, context| {
            let duty = context.duty_name().to_string();
            steward_log.push(format!("{}:{}", duty, context.function_name()));
            match duty.as_str() {
                "flow_first" => context.do_flow("side", ()).map(|_| ()),
                "spawn_then_fail" => {
                    context.do_flow("side", ())?;
                    Err(Fault::application("duty refused"))
                }
                _ => Err(Fault::application("duty refused")),
            }
        })),
    )
    .function("work", move |ctx| {
        work_log.push(ctx.function_name().to_string());
        Ok(())
    })
    .function("side", move |_ctx| {
        side_log.push("side");
        Ok(())
    })
    .function("recover", move |ctx| {
        let message = ctx.argument().fault().map(|f| f.message().to_string());
        recover_log.push(format!("recovered:{}", message.unwrap_or_default()));
        Ok(())
    })
    .build()
    .unwrap();
    kernel.open_kernel().unwrap();
    kernel
}

#[test]
fn test_duty_flow_runs_before_function() {
    let log = Log::default();
    let kernel = build_hooks(&log);

    let handle = kernel.office("office").unwrap().invoke_function("duty_flow", ()).unwrap();

    assert!(handle.wait_timeout(Duration::from_secs(2)).unwrap().is_completed());
    assert_eq!(log.entries(), vec!["flow_first:duty_flow", "side", "duty_flow"]);
}

#[test]
fn test_failing_duty_abandons_spawned_flow() {
    let log = Log::default();
    let kernel = build_hooks(&log);
    let office = kernel.office("office").unwrap();

    let handle = office.invoke_function("duty_spawn_fail", ()).unwrap();
    let outcome = handle.wait_timeout(Duration::from_secs(2)).unwrap();

    assert_eq!(outcome.fault().expect("duty fault is unhandled").message(), "duty refused");
    assert_eq!(log.entries(), vec!["spawn_then_fail:duty_spawn_fail"]);
    let status = office.status();
    assert_eq!(status.processes_failed, 1);
    assert_eq!(status.processes_active, 0);
}

#[test]
fn test_duty_escalation_procedure_handles_duty_fault() {
    let log = Log::default();
    let kernel = build_hooks(&log);

    let handle = kernel.office("office").unwrap().invoke_function("duty_guarded", ()).unwrap();

    assert!(handle.wait_timeout(Duration::from_secs(2)).unwrap().is_completed());
    assert_eq!(log.entries(), vec!["refuse:duty_guarded", "recovered:duty refused"]);
}

#[test]
fn test_governance_flow_runs_after_enforcement() {
    let log = Log::default();
    let kernel = build_hooks(&log);

    let handle = kernel.office("office").unwrap().invoke_function("flowing_work", ()).unwrap();

    assert!(handle.wait_timeout(Duration::from_secs(2)).unwrap().is_completed());
    assert_eq!(log.entries(), vec!["flowing_work", "enforce:flowing", "side"]);
}

#[test]
fn test_failing_governance_abandons_spawned_flow() {
    let log = Log::default();
    let kernel = build_hooks(&log);
    let office = kernel.office("office").unwrap();

    let handle = office.invoke_function("spawning_work", ()).unwrap();
    let outcome = handle.wait_timeout(Duration::from_secs(2)).unwrap();

    assert_eq!(
        outcome.fault().expect("enforcement fault is unhandled").message(),
        "ledger out of balance"
    );
    assert_eq!(log.entries(), vec!["spawning_work", "enforce:spawning"]);
    assert_eq!(office.status().processes_active, 0);
}

#[test]
fn test_governance_escalation_procedure_handles_enforcement_fault() {
    let log = Log::default();
    let kernel = build_hooks(&log);

    let handle = kernel.office("office").unwrap().invoke_function("guarded_work", ()).unwrap();

    assert!(handle.wait_timeout(Duration::from_secs(2)).unwrap().is_completed());
    assert_eq!(
        log.entries(),
        vec!["guarded_work", "enforce:guarded", "recovered:ledger rejected"]
    );
}

#[test]
fn test_explicit_empty_hooks_match_omitted_hooks() {
    let log = Log::default();
    let kernel = build_hooks(&log);
    let office = kernel.office("office").unwrap();

    let handle = office.invoke_function("implicit", ()).unwrap();
    assert!(handle.wait_timeout(Duration::from_secs(2)).unwrap().is_completed());
    let implicit = office.status().job_nodes_created;

    let handle = office.invoke_function("explicit", ()).unwrap();
    assert!(handle.wait_timeout(Duration::from_secs(2)).unwrap().is_completed());
    let explicit = office.status().job_nodes_created - implicit;

    assert_eq!(implicit, 1);
    assert_eq!(explicit, implicit);
    assert_eq!(log.entries(), vec!["implicit", "explicit"]);
}
