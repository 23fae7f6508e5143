//! File-to-file jobs on the serverless backend, run through the in-process
//! invoker with scripted failures.

mod common;

use std::sync::Arc;

use common::{csv_of_size, int_schema, ints, quick_config, CappedInvoker};
use rowforge::core::config::{BackendKind, EngineConfig};
use rowforge::core::exception::ExceptionCode;
use rowforge::core::schema::{DataType, Field, Schema};
use rowforge::core::types::Scalar;
use rowforge::exec::{FaultyInvoker, InvocationFailure, InvocationService};
use rowforge::io::StorageRegistry;
use rowforge::{ExecError, Plan, PlanContext};

const SCRATCH: &str = "memory://rowforge-scratch";

fn serverless() -> EngineConfig {
    EngineConfig {
        backend: BackendKind::Serverless,
        ..quick_config()
    }
}

/// Three inputs of 100, 50 and 50 bytes holding 49, 24 and 24 rows.
fn seed_inputs(storage: &StorageRegistry) -> Vec<String> {
    let uris = vec![
        "memory://in/a.csv".to_string(),
        "memory://in/b.csv".to_string(),
        "memory://in/c.csv".to_string(),
    ];
    storage.write(&uris[0], &csv_of_size(100, 1)).unwrap();
    storage.write(&uris[1], &csv_of_size(50, 2)).unwrap();
    storage.write(&uris[2], &csv_of_size(50, 3)).unwrap();
    uris
}

fn plan_with(storage: &StorageRegistry, invoker: Arc<dyn InvocationService>, udf: &str) -> Plan {
    let ctx = PlanContext::new();
    let job = ctx
        .csv(seed_inputs(storage), int_schema("x"))
        .map(udf)
        .unwrap()
        .collect();
    Plan::from_logical(&job, serverless())
        .with_storage(storage.clone())
        .with_invoker(invoker)
}

#[test]
fn inputs_are_packed_into_capped_invocations() {
    let storage = StorageRegistry::new();
    let invoker = Arc::new(CappedInvoker::new(&storage, 100));
    let mut plan = plan_with(&storage, invoker, "x * 2 AS y");

    let rs = plan.execute().unwrap();
    assert_eq!(rs.len(), 97);
    assert_eq!(plan.diagnostics().invocations, 2);
    assert_eq!(plan.diagnostics().backend, Some(BackendKind::Serverless));
    assert_eq!(plan.diagnostics().total_retries(), 0);
    assert_eq!(plan.manifest().map(|m| m.backend), Some(BackendKind::Serverless));
    assert!(storage.list(SCRATCH).unwrap().is_empty());
}

#[test]
fn serverless_matches_local_results() {
    let storage = StorageRegistry::new();
    let invoker = Arc::new(CappedInvoker::new(&storage, 100));
    let mut remote = plan_with(&storage, invoker, "60 // (x - 2) AS y");
    let remote_rows = remote.execute().unwrap().rows.clone();

    let ctx = PlanContext::new();
    let job = ctx
        .csv(seed_inputs(&storage), int_schema("x"))
        .map("60 // (x - 2) AS y")
        .unwrap()
        .collect();
    let local_cfg = EngineConfig {
        backend: BackendKind::Local,
        ..quick_config()
    };
    let mut local = Plan::from_logical(&job, local_cfg).with_storage(storage.clone());
    let local_rows = local.execute().unwrap().rows.clone();

    assert_eq!(remote_rows, local_rows);
    assert_eq!(remote.exception_counts(), local.exception_counts());
    assert_eq!(remote.exception_counts().get("ZeroDivisionError"), Some(&24));

    // an empty string is not a missing value on the way back from scratch
    storage.write("memory://in/s.csv", b"s\n a\n \n").unwrap();
    let strings = Schema::new(vec![Field::new("s", DataType::Utf8, true)]);
    let run = |backend| {
        let ctx = PlanContext::new();
        let job = ctx
            .csv(vec!["memory://in/s.csv".to_string()], strings.clone())
            .map("strip(s) AS s")
            .unwrap()
            .collect();
        let cfg = EngineConfig {
            backend,
            ..quick_config()
        };
        let invoker: Arc<dyn InvocationService> = Arc::new(CappedInvoker::new(&storage, 100));
        let mut plan = Plan::from_logical(&job, cfg)
            .with_storage(storage.clone())
            .with_invoker(invoker);
        plan.execute().unwrap().rows.clone()
    };
    let expected = vec![vec![Scalar::from("a")], vec![Scalar::from("")]];
    assert_eq!(run(BackendKind::Serverless), expected);
    assert_eq!(run(BackendKind::Local), expected);
}

#[test]
fn flaky_invocations_are_retried_and_counted() {
    let storage = StorageRegistry::new();
    let faulty = Arc::new(
        FaultyInvoker::new(CappedInvoker::new(&storage, 100))
            .fail_next(0, [InvocationFailure::Throttled, InvocationFailure::TimedOut(10)])
            .fail_next(1, [InvocationFailure::Crashed("worker restarted".into())]),
    );
    let mut plan = plan_with(&storage, faulty.clone(), "x + 1 AS y");

    let rs = plan.execute().unwrap();
    assert_eq!(rs.len(), 97);
    let diag = plan.diagnostics();
    assert_eq!(diag.retries.get(&0), Some(&2));
    assert_eq!(diag.retries.get(&1), Some(&1));
    assert_eq!(diag.total_retries(), 3);
    assert!(diag.failed_partitions.is_empty());
    assert_eq!(faulty.calls(), 5);
}

#[test]
fn exhausted_partition_becomes_partition_failure() {
    let storage = StorageRegistry::new();
    let faulty = Arc::new(
        FaultyInvoker::new(CappedInvoker::new(&storage, 100)).fail_always(1, InvocationFailure::Throttled),
    );
    let mut plan = plan_with(&storage, faulty.clone(), "x AS y");

    let rs = plan.execute().unwrap();
    assert_eq!(rs.len(), 49);
    let diag = plan.diagnostics();
    assert_eq!(diag.failed_partitions, vec![1]);
    assert_eq!(diag.retries.get(&1), Some(&3));
    let lost: u64 = diag
        .tally
        .unresolved
        .iter()
        .filter(|((_, code), _)| *code == ExceptionCode::PartitionFailure)
        .map(|(_, n)| *n)
        .sum();
    assert_eq!(lost, 48);
    // one first attempt plus three retries for the lost partition
    assert_eq!(faulty.calls(), 1 + 4);
}

#[test]
fn job_fails_when_every_partition_fails() {
    let storage = StorageRegistry::new();
    let faulty = Arc::new(
        FaultyInvoker::new(CappedInvoker::new(&storage, 100))
            .fail_always(0, InvocationFailure::TimedOut(5))
            .fail_always(1, InvocationFailure::Throttled),
    );
    let mut plan = plan_with(&storage, faulty, "x AS y");
    match plan.execute() {
        Err(ExecError::JobFailed { reason }) => assert!(reason.contains("all 2 partitions failed")),
        other => panic!("expected job failure, got {other:?}"),
    }
    assert!(plan.manifest().is_none());
}

#[test]
fn non_retryable_failure_aborts_without_retrying() {
    let storage = StorageRegistry::new();
    let faulty = Arc::new(
        FaultyInvoker::new(CappedInvoker::new(&storage, 100))
            .fail_always(0, InvocationFailure::PermissionDenied("bucket policy".into())),
    );
    let mut plan = plan_with(&storage, faulty, "x AS y");
    assert!(matches!(plan.execute(), Err(ExecError::JobFailed { .. })));
    assert_eq!(plan.diagnostics().retries.get(&0), None);
    // the part the healthy invocation wrote is gone too
    assert!(storage.list(SCRATCH).unwrap().is_empty());
}

#[test]
fn csv_to_csv_job_writes_one_part_per_invocation() {
    let storage = StorageRegistry::new();
    let ctx = PlanContext::new();
    let job = ctx
        .csv(seed_inputs(&storage), int_schema("x"))
        .filter("x != 2")
        .unwrap()
        .to_csv("memory://out/filtered", true);
    let invoker: Arc<dyn InvocationService> = Arc::new(CappedInvoker::new(&storage, 100));
    let mut plan = Plan::from_logical(&job, serverless())
        .with_storage(storage.clone())
        .with_invoker(invoker);

    let rs = plan.execute().unwrap();
    assert_eq!(rs.written.len(), 2);
    assert_eq!(rs.row_count, 73);
    let mut values = Vec::new();
    for uri in &rs.written {
        let text = String::from_utf8(storage.read(uri).unwrap()).unwrap();
        values.extend(text.lines().skip(1).map(|l| l.parse::<i64>().unwrap()));
    }
    assert_eq!(values.len(), 73);
    assert!(!values.contains(&2));
}

#[test]
fn auto_backend_offloads_when_input_exceeds_memory_cap() {
    let storage = StorageRegistry::new();
    let ctx = PlanContext::new();
    let job = ctx
        .csv(seed_inputs(&storage), int_schema("x"))
        .map("x * 3 AS y")
        .unwrap()
        .collect();
    let cfg = EngineConfig {
        mem_cap_bytes: 64,
        ..quick_config()
    };
    let mut plan = Plan::from_logical(&job, cfg).with_storage(storage.clone());
    assert!(plan.explain().contains("backend: serverless"));

    let rs = plan.execute().unwrap();
    assert_eq!(ints(&rs.rows, 0).len(), 97);
    assert_eq!(plan.diagnostics().backend, Some(BackendKind::Serverless));
}
