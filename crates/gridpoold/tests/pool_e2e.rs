//! End-to-end pool scenarios against the worker stub binary.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use gridpool_arbiter::{
    ArbiterConfig, ArbiterError, GridServerResource, InstancePool, ResourceSettings,
};
use gridpool_dispatch::DispatchError;
use gridpool_ports::{PortAllocator, PortAllocatorConfig};
use gridpool_process::{ProcessLifecycleManager, ProcessSettings};
use gridpool_wire::{Job, LuaValue, ScriptExecution};

const STUB: &str = env!("CARGO_BIN_EXE_gridpool-worker-stub");

/// Each test gets its own port range so concurrent tests never collide.
fn pool_with(config: ArbiterConfig, delay_ms: u64, port_base: u16) -> InstancePool {
    let ports = Arc::new(PortAllocator::new(PortAllocatorConfig {
        range: port_base..port_base + 40,
        ..PortAllocatorConfig::default()
    }));
    let extra_args = if delay_ms > 0 {
        vec!["--delay-ms".to_string(), delay_ms.to_string()]
    } else {
        Vec::new()
    };
    let lifecycle = Arc::new(ProcessLifecycleManager::new(
        ProcessSettings {
            executable: STUB.into(),
            extra_args,
            wait_for_tcp_sleep_interval: Duration::from_millis(50),
            ..ProcessSettings::default()
        },
        ports,
    ));
    InstancePool::new(config, lifecycle, ResourceSettings::default())
}

fn small_config() -> ArbiterConfig {
    ArbiterConfig {
        max_instances: 2,
        ready_instances_to_keep_in_reserve: 1,
        ..ArbiterConfig::default()
    }
}

#[tokio::test]
async fn sequential_executes_reuse_one_instance() {
    let pool = pool_with(small_config(), 0, 63000);

    let first = pool
        .execute_script(ScriptExecution::new("s1", "return 1"), GridServerResource::none(), None)
        .await
        .unwrap();
    assert_eq!(first, vec![LuaValue::string("return 1")]);

    let second = pool
        .execute_script(ScriptExecution::new("s2", "return 2"), GridServerResource::none(), None)
        .await
        .unwrap();
    assert_eq!(second, vec![LuaValue::string("return 2")]);

    // The first instance went back to the ready set and served both calls.
    assert_eq!(pool.instance_count(), 1);

    pool.shutdown().await;
}

#[tokio::test]
async fn exhausted_pool_fails_fast_with_zero_timeout() {
    let pool = pool_with(small_config(), 2000, 63050);

    // Two in-flight executes occupy both permitted instances.
    let p1 = pool.clone();
    let busy1 = tokio::spawn(async move {
        p1.execute_script(ScriptExecution::new("b1", "return 1"), GridServerResource::none(), None)
            .await
    });
    let p2 = pool.clone();
    let busy2 = tokio::spawn(async move {
        p2.execute_script(ScriptExecution::new("b2", "return 2"), GridServerResource::none(), None)
            .await
    });

    // Let both leases land before probing.
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(pool.instance_count(), 2);

    let err = pool
        .get_or_create_available_leased_instance(Duration::ZERO, GridServerResource::none())
        .await
        .unwrap_err();
    assert!(matches!(err, ArbiterError::NoReadyInstance(_)));

    busy1.await.unwrap().unwrap();
    busy2.await.unwrap().unwrap();
    pool.shutdown().await;
}

#[tokio::test]
async fn leased_instance_is_never_double_leased() {
    let config = ArbiterConfig {
        max_instances: 1,
        ..ArbiterConfig::default()
    };
    let pool = pool_with(config, 0, 63100);

    let grant = pool
        .get_or_create_available_leased_instance(Duration::ZERO, GridServerResource::none())
        .await
        .unwrap();
    let first_id = grant.instance.id().to_owned();

    let err = pool
        .get_or_create_available_leased_instance(Duration::ZERO, GridServerResource::none())
        .await
        .unwrap_err();
    assert!(matches!(err, ArbiterError::NoReadyInstance(_)));

    pool.release(&first_id).await.unwrap();

    let regrant = pool
        .get_or_create_available_leased_instance(Duration::ZERO, GridServerResource::none())
        .await
        .unwrap();
    assert_eq!(regrant.instance.id(), first_id);

    pool.shutdown().await;
}

#[tokio::test]
async fn stale_lease_settle_cannot_free_a_successor_lease() {
    let config = ArbiterConfig {
        max_instances: 1,
        ..ArbiterConfig::default()
    };
    let pool = pool_with(config, 0, 63450);

    let first = pool
        .get_or_create_available_leased_instance(Duration::ZERO, GridServerResource::none())
        .await
        .unwrap();
    let id = first.instance.id().to_owned();
    pool.release(&id).await.unwrap();

    // Reclaim before the release listener's settle task gets to run.
    let second = pool
        .get_or_create_available_leased_instance(Duration::ZERO, GridServerResource::none())
        .await
        .unwrap();
    assert_eq!(second.instance.id(), id);

    // Give the stale settle every opportunity to misfire.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The slot is still held by the second lease; nothing may hand it out.
    let err = pool
        .get_or_create_available_leased_instance(Duration::ZERO, GridServerResource::none())
        .await
        .unwrap_err();
    assert!(matches!(err, ArbiterError::NoReadyInstance(_)));
    // And the earlier lease end was settled exactly once.
    assert_eq!(second.instance.reuse_count().await, 1);

    pool.release(&id).await.unwrap();
    pool.shutdown().await;
}

#[tokio::test]
async fn retirement_drops_the_lease_listener() {
    let config = ArbiterConfig {
        max_instances: 1,
        max_instance_reuses: 1,
        ..ArbiterConfig::default()
    };
    let pool = pool_with(config, 0, 63500);

    let grant = pool
        .get_or_create_available_leased_instance(Duration::ZERO, GridServerResource::none())
        .await
        .unwrap();
    let id = grant.instance.id().to_owned();
    assert_eq!(pool.leases().listener_count(&id), 1);

    // The single permitted reuse is spent, so release retires the slot.
    pool.release(&id).await.unwrap();
    assert_eq!(pool.instance_count(), 0);
    assert_eq!(pool.leases().listener_count(&id), 0);

    pool.shutdown().await;
}

#[tokio::test]
async fn dead_ready_worker_is_reaped_and_replaced() {
    let config = ArbiterConfig {
        max_instances: 2,
        ready_instances_to_keep_in_reserve: 1,
        populate_ready_instance_threads: 1,
        populate_interval: Duration::from_millis(100),
        ..ArbiterConfig::default()
    };
    let pool = pool_with(config, 0, 63550);
    pool.start_populator();

    // Materialize an instance and learn which process backs it.
    let grant = pool
        .get_or_create_available_leased_instance(
            Duration::from_secs(10),
            GridServerResource::none(),
        )
        .await
        .unwrap();
    let doomed = grant.instance.id().to_owned();
    let pid = grant.instance.worker_pid().await.expect("worker pid");
    pool.release(&doomed).await.unwrap();

    // Kill the worker out from under its ready slot.
    std::process::Command::new("kill")
        .arg("-9")
        .arg(pid.to_string())
        .status()
        .expect("kill");

    // The populator pass reaps the dead slot and restocks the reserve.
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        let ids = pool.instance_ids();
        if !ids.contains(&doomed) && !ids.is_empty() {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "dead worker was never reaped and replaced"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    pool.shutdown().await;
}

#[tokio::test]
async fn reuse_cap_retires_the_instance() {
    let config = ArbiterConfig {
        max_instances: 2,
        max_instance_reuses: 1,
        ..ArbiterConfig::default()
    };
    let pool = pool_with(config, 0, 63150);

    pool.execute_script(ScriptExecution::new("s", "return 1"), GridServerResource::none(), None)
        .await
        .unwrap();
    // One lease spent the whole reuse budget.
    assert_eq!(pool.instance_count(), 0);

    // The pool recovers by starting a fresh instance.
    pool.execute_script(ScriptExecution::new("s", "return 2"), GridServerResource::none(), None)
        .await
        .unwrap();
    assert_eq!(pool.instance_count(), 0);

    pool.shutdown().await;
}

#[tokio::test]
async fn script_error_surfaces_without_poisoning_the_instance() {
    let pool = pool_with(small_config(), 0, 63200);

    let err = pool
        .execute_script(ScriptExecution::new("bad", "error()"), GridServerResource::none(), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ArbiterError::Dispatch(DispatchError::Rpc(_))
    ));

    // Script failures are the caller's problem; the instance stays usable.
    let ok = pool
        .execute_script(ScriptExecution::new("good", "return 3"), GridServerResource::none(), None)
        .await
        .unwrap();
    assert_eq!(ok, vec![LuaValue::string("return 3")]);
    assert_eq!(pool.instance_count(), 1);

    pool.shutdown().await;
}

#[tokio::test]
async fn open_job_and_diag_round_trip() {
    let pool = pool_with(small_config(), 0, 63250);

    let opened = pool
        .open_job(
            Job::new("job-7", 30.0),
            ScriptExecution::empty(),
            GridServerResource::none(),
            None,
        )
        .await
        .unwrap();
    assert_eq!(opened, vec![LuaValue::string("job-7")]);

    let diag = pool.diag_ex(2, "job-7", None).await.unwrap();
    assert_eq!(diag, vec![LuaValue::number(2.0)]);

    pool.shutdown().await;
}

#[tokio::test]
async fn canceled_call_releases_the_lease() {
    let pool = pool_with(small_config(), 2000, 63300);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let p = pool.clone();
    let call = tokio::spawn(async move {
        p.execute_script(
            ScriptExecution::new("slow", "return 1"),
            GridServerResource::none(),
            Some(cancel_rx),
        )
        .await
    });

    tokio::time::sleep(Duration::from_millis(800)).await;
    cancel_tx.send(true).unwrap();

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, ArbiterError::Canceled));

    // The canceled caller's lease resolved; the instance is claimable again.
    let grant = pool
        .get_or_create_available_leased_instance(Duration::ZERO, GridServerResource::none())
        .await
        .unwrap();
    assert_eq!(pool.instance_count(), 1);
    drop(grant);

    pool.shutdown().await;
}

#[tokio::test]
async fn populator_keeps_a_warm_reserve() {
    let config = ArbiterConfig {
        max_instances: 4,
        ready_instances_to_keep_in_reserve: 2,
        populate_ready_instance_threads: 2,
        populate_interval: Duration::from_millis(100),
        ..ArbiterConfig::default()
    };
    let pool = pool_with(config, 0, 63350);
    pool.start_populator();

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while pool.instance_count() < 2 {
        assert!(
            std::time::Instant::now() < deadline,
            "populator never reached the reserve target"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    pool.shutdown().await;
}

#[tokio::test]
async fn waiter_is_woken_by_a_release() {
    let config = ArbiterConfig {
        max_instances: 1,
        ..ArbiterConfig::default()
    };
    let pool = pool_with(config, 1500, 63400);

    let p = pool.clone();
    let busy = tokio::spawn(async move {
        p.execute_script(ScriptExecution::new("slow", "return 1"), GridServerResource::none(), None)
            .await
    });
    tokio::time::sleep(Duration::from_millis(700)).await;

    // Blocks until the in-flight execute releases its lease.
    let grant = pool
        .get_or_create_available_leased_instance(Duration::from_secs(10), GridServerResource::none())
        .await
        .unwrap();

    busy.await.unwrap().unwrap();
    pool.release(grant.instance.id()).await.unwrap();
    pool.shutdown().await;
}
