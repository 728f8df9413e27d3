//! Managed object integration tests - sourcing, pooling, dependencies and
//! asynchronous operations seen through whole processes.

mod common;

use common::{config, manual_assets, DeferredSource, Log};
use floor_kernel::kernel::{
    faults, AsynchronousContext, FnManagedObjectSource, KernelBuilder, ManagedObject, ObjectRegistry,
    ValueManagedObject,
};
use floor_kernel::kernel::Fault;
use serde_json::json;
use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn reader_config(timeout: &str) -> serde_json::Value {
    json!({
        "assets": manual_assets(),
        "managed_object_sources": [ { "name": "db", "source": "deferred", "timeout": timeout } ],
        "offices": [{
            "name": "office",
            "managed_objects": [ { "name": "conn", "source": "db", "scope": "process" } ],
            "functions": [ { "name": "read", "function": "read", "objects": [ { "object": "conn" } ] } ]
        }]
    })
}

#[test]
fn test_deferred_object_resumes_waiting_function() {
    let source = Arc::new(DeferredSource::default());
    let seen = Log::default();
    let recorded = seen.clone();
    let kernel = KernelBuilder::new(config(reader_config("10s")))
        .managed_object_source("deferred", source.clone())
        .function("read", move |ctx| {
            let conn = ctx.object_as::<u32>("conn")?;
            recorded.push(conn.to_string());
            Ok(())
        })
        .build()
        .unwrap();
    kernel.open_kernel().unwrap();

    let handle = kernel.office("office").unwrap().invoke_function("read", ()).unwrap();
    assert!(!handle.is_complete());
    assert_eq!(source.pending(), 1);
    assert_eq!(kernel.status().waiting_job_nodes, 1);

    let deliverer = source.clone();
    std::thread::spawn(move || deliverer.deliver(7)).join().unwrap();

    assert!(handle.wait_timeout(Duration::from_secs(2)).unwrap().is_completed());
    assert_eq!(seen.entries(), vec!["7"]);
    assert_eq!(kernel.status().waiting_job_nodes, 0);
}

#[test]
fn test_sourcing_timeout_fails_process() {
    let source = Arc::new(DeferredSource::default());
    let kernel = KernelBuilder::new(config(reader_config("20ms")))
        .managed_object_source("deferred", source.clone())
        .function("read", |_ctx| Ok(()))
        .build()
        .unwrap();
    kernel.open_kernel().unwrap();

    let handle = kernel.office("office").unwrap().invoke_function("read", ()).unwrap();
    std::thread::sleep(Duration::from_millis(40));
    let report = kernel.check_on_assets();

    assert!(report.activated >= 1);
    let outcome = handle.wait_timeout(Duration::from_secs(2)).unwrap();
    let fault = outcome.fault().expect("sourcing should time out");
    assert!(fault.is_a(&faults::SOURCE_MANAGED_OBJECT_TIMED_OUT));
    assert!(fault.is_a(&faults::MANAGED_OBJECT));

    // A late arrival is handed straight back
    source.deliver(1);
    assert_eq!(kernel.status().waiting_job_nodes, 0);
}

#[test]
fn test_sourcing_timeout_fires_without_runtime_or_manual_sweep() {
    let source = Arc::new(DeferredSource::default());
    let mut raw = reader_config("20ms");
    raw["assets"] = json!({ "check_interval": "10ms", "monitor_on_open": true, "max_nodes_per_run": 64 });
    let kernel = KernelBuilder::new(config(raw))
        .managed_object_source("deferred", source.clone())
        .function("read", |_ctx| Ok(()))
        .build()
        .unwrap();
    kernel.open_kernel().unwrap();

    let handle = kernel.office("office").unwrap().invoke_function("read", ()).unwrap();
    let outcome = handle.wait_timeout(Duration::from_secs(2)).unwrap();

    let fault = outcome.fault().expect("sourcing should time out");
    assert!(fault.is_a(&faults::SOURCE_MANAGED_OBJECT_TIMED_OUT));
    assert!(kernel.asset_manager().sweeps() > 0);
    kernel.close_kernel();
}

#[test]
fn test_failed_sourcing_is_managed_object_fault() {
    let kernel = KernelBuilder::new(config(json!({
        "assets": manual_assets(),
        "managed_object_sources": [ { "name": "db", "source": "broken" } ],
        "offices": [{
            "name": "office",
            "managed_objects": [ { "name": "conn", "source": "db", "scope": "thread" } ],
            "functions": [ { "name": "read", "function": "read", "objects": [ { "object": "conn" } ] } ]
        }]
    })))
    .managed_object_source(
        "broken",
        Arc::new(FnManagedObjectSource::new(|| Err(Fault::application("refused")))),
    )
    .function("read", |_ctx| Ok(()))
    .build()
    .unwrap();
    kernel.open_kernel().unwrap();

    let handle = kernel.office("office").unwrap().invoke_function("read", ()).unwrap();
    let outcome = handle.wait_timeout(Duration::from_secs(2)).unwrap();
    let fault = outcome.fault().unwrap();
    assert!(fault.is_a(&faults::FAILED_TO_SOURCE_MANAGED_OBJECT));
    assert_eq!(fault.root_cause().message(), "refused");
}

#[test]
fn test_pool_reuses_instances_and_empties_once_on_close() {
    let created = Arc::new(AtomicUsize::new(0));
    let counter = created.clone();
    let kernel = KernelBuilder::new(config(json!({
        "assets": manual_assets(),
        "managed_object_sources": [ { "name": "db", "source": "values", "pool": "free_list" } ],
        "offices": [{
            "name": "office",
            "managed_objects": [ { "name": "conn", "source": "db", "scope": "process" } ],
            "functions": [ { "name": "read", "function": "read", "objects": [ { "object": "conn" } ] } ]
        }]
    })))
    .managed_object_source(
        "values",
        Arc::new(FnManagedObjectSource::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(ValueManagedObject::new(1u32)) as Arc<dyn ManagedObject>)
        })),
    )
    .function("read", |ctx| ctx.object_as::<u32>("conn").map(|_| ()))
    .build()
    .unwrap();
    kernel.open_kernel().unwrap();

    let office = kernel.office("office").unwrap();
    for _ in 0..3 {
        let handle = office.invoke_function("read", ()).unwrap();
        assert!(handle.wait_timeout(Duration::from_secs(2)).unwrap().is_completed());
    }

    assert_eq!(created.load(Ordering::SeqCst), 1);
    let pool = &kernel.status().pools[0];
    assert_eq!(pool.sourced, 1);
    assert_eq!(pool.reused, 2);
    assert_eq!(pool.free, 1);
    assert_eq!(pool.checked_out, 0);

    kernel.close_kernel();
    let after_close = kernel.status().pools[0].clone();
    assert!(after_close.emptied);
    assert_eq!(after_close.free, 0);
    assert_eq!(after_close.released, 1);

    kernel.close_kernel();
    assert_eq!(kernel.status().pools[0], after_close);
}

/// Coordinating object exposing the connection it was given.
#[derive(Debug, Default)]
struct Repository {
    connection: Arc<Mutex<Option<u32>>>,
}

impl ManagedObject for Repository {
    fn object(&self) -> Arc<dyn Any + Send + Sync> {
        self.connection.clone()
    }

    fn load_objects(&self, registry: &ObjectRegistry<'_>) -> Result<(), Fault> {
        let connection = registry.object_as::<u32>("conn")?;
        *self.connection.lock().unwrap() = Some(*connection);
        Ok(())
    }
}

#[test]
fn test_coordinating_object_receives_dependencies() {
    let seen = Log::default();
    let recorded = seen.clone();
    let kernel = KernelBuilder::new(config(json!({
        "assets": manual_assets(),
        "managed_object_sources": [
            { "name": "connections", "source": "connections" },
            { "name": "repositories", "source": "repositories" }
        ],
        "offices": [{
            "name": "office",
            "managed_objects": [
                { "name": "conn", "source": "connections", "scope": "process" },
                {
                    "name": "repo",
                    "source": "repositories",
                    "scope": "thread",
                    "dependencies": [ { "object": "conn" } ]
                }
            ],
            "functions": [ { "name": "load", "function": "load", "objects": [ { "object": "repo" } ] } ]
        }]
    })))
    .managed_object_source(
        "connections",
        Arc::new(FnManagedObjectSource::new(|| {
            Ok(Arc::new(ValueManagedObject::new(5u32)) as Arc<dyn ManagedObject>)
        })),
    )
    .managed_object_source(
        "repositories",
        Arc::new(FnManagedObjectSource::new(|| {
            Ok(Arc::new(Repository::default()) as Arc<dyn ManagedObject>)
        })),
    )
    .function("load", move |ctx| {
        let repo = ctx.object_as::<Mutex<Option<u32>>>("repo")?;
        let connection = *repo.lock().unwrap();
        recorded.push(format!("{:?}", connection));
        Ok(())
    })
    .build()
    .unwrap();
    kernel.open_kernel().unwrap();

    let handle = kernel.office("office").unwrap().invoke_function("load", ()).unwrap();

    assert!(handle.wait_timeout(Duration::from_secs(2)).unwrap().is_completed());
    assert_eq!(seen.entries(), vec!["Some(5)"]);
}

/// Object that keeps the context for its asynchronous operations.
#[derive(Debug)]
struct Socket {
    context: Arc<Mutex<Option<AsynchronousContext>>>,
}

impl ManagedObject for Socket {
    fn object(&self) -> Arc<dyn Any + Send + Sync> {
        self.context.clone()
    }

    fn register_asynchronous_listener(&self, context: AsynchronousContext) {
        *self.context.lock().unwrap() = Some(context);
    }
}

#[test]
fn test_asynchronous_operation_holds_next_function() {
    let slot: Arc<Mutex<Option<AsynchronousContext>>> = Arc::default();
    let source_slot = slot.clone();
    let log = Log::default();
    let (begin_log, finish_log) = (log.clone(), log.clone());
    let kernel = KernelBuilder::new(config(json!({
        "assets": manual_assets(),
        "managed_object_sources": [ { "name": "sockets", "source": "sockets" } ],
        "offices": [{
            "name": "office",
            "managed_objects": [ { "name": "socket", "source": "sockets", "scope": "thread" } ],
            "functions": [
                { "name": "begin", "function": "begin", "objects": [ { "object": "socket" } ], "next": "finish" },
                { "name": "finish", "function": "finish", "objects": [ { "object": "socket" } ] }
            ]
        }]
    })))
    .managed_object_source(
        "sockets",
        Arc::new(FnManagedObjectSource::new(move || {
            Ok(Arc::new(Socket {
                context: source_slot.clone(),
            }) as Arc<dyn ManagedObject>)
        })),
    )
    .function("begin", move |ctx| {
        let socket = ctx.object_as::<Mutex<Option<AsynchronousContext>>>("socket")?;
        if let Some(operation) = socket.lock().unwrap().as_ref() {
            operation.start_operation();
        }
        begin_log.push("begin");
        Ok(())
    })
    .function("finish", move |_ctx| {
        finish_log.push("finish");
        Ok(())
    })
    .build()
    .unwrap();
    kernel.open_kernel().unwrap();

    let handle = kernel.office("office").unwrap().invoke_function("begin", ()).unwrap();
    assert_eq!(log.entries(), vec!["begin"]);
    assert!(!handle.is_complete());

    let operation = slot.lock().unwrap().clone().unwrap();
    assert!(operation.is_in_progress());
    operation.complete_operation();

    assert!(handle.wait_timeout(Duration::from_secs(2)).unwrap().is_completed());
    assert_eq!(log.entries(), vec!["begin", "finish"]);
}
