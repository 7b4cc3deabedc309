//! Failover scenarios: lost-lease suicide, takeover, safe handover.

mod common;

use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use tsod::service::clock::{SystemClockSource, system_tai_now_ns};
use tsod::service::consensus::{ClusterHandle, InMemoryConsensus};
use tsod::service::controller::{ControllerError, MasterView};
use tsod::service::worker::WorkerError;
use tsod::{Error, Service, Transience};

use common::{FlakyConsensus, retry_batch, retry_batch_for, test_config};

fn wait_for_controller_exit(service: &Service, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !service.controller_finished() {
        assert!(Instant::now() < deadline, "controller still running");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn master_kills_itself_after_losing_consensus() {
    let cluster = ClusterHandle::new();
    let (consensus, offline) = FlakyConsensus::new(InMemoryConsensus::new(cluster.clone()));
    let service = Service::start(
        &test_config(15500, 3),
        Box::new(consensus),
        Box::new(SystemClockSource::default()),
    )
    .expect("service start");
    let handle = service.handle().clone();

    // healthy master serving batches
    retry_batch(&handle, 0, 10);

    offline.store(true, Ordering::SeqCst);

    // three failed heartbeats at 10ms each, with slack
    wait_for_controller_exit(&service, Duration::from_secs(2));

    // workers were paused before the controller died
    assert!(matches!(
        handle.timestamp_batch(0, 1),
        Err(WorkerError::NotReady)
    ));

    let err = service.join().expect_err("controller must report the lost lease");
    assert!(matches!(
        err,
        Error::Controller(ControllerError::LeaseLost)
    ));
    assert_eq!(err.transience(), Transience::Permanent);
}

#[test]
fn standby_takes_over_and_waits_out_the_reservation() {
    let cluster = ClusterHandle::new();
    let (a_consensus, a_offline) = FlakyConsensus::new(InMemoryConsensus::new(cluster.clone()));
    let a = Service::start(
        &test_config(15600, 2),
        Box::new(a_consensus),
        Box::new(SystemClockSource::default()),
    )
    .expect("start a");
    let b = Service::start(
        &test_config(15650, 2),
        Box::new(InMemoryConsensus::new(cluster.clone())),
        Box::new(SystemClockSource::default()),
    )
    .expect("start b");

    retry_batch(a.handle(), 0, 10);

    // cut the master off; it suicides, its lease expires, B takes over
    a_offline.store(true, Ordering::SeqCst);
    let a_threshold = cluster.reserved_time_threshold();
    assert!(a_threshold > 0);

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        match b.handle().master_url().expect("master url") {
            MasterView::Master { .. } => break,
            _ => {
                assert!(Instant::now() < deadline, "standby never took over");
                thread::sleep(Duration::from_millis(2));
            }
        }
    }

    // no timestamp before the dead master's reservation has passed
    let batch = retry_batch_for(b.handle(), 0, 50, Duration::from_secs(2));
    assert!(
        batch.tbe_base > a_threshold,
        "first timestamp {} inside the previous reservation {}",
        batch.tbe_base,
        a_threshold
    );

    wait_for_controller_exit(&a, Duration::from_secs(2));
    let _ = a.join();
    b.stop().expect("stop b");
}

#[test]
fn restart_resumes_past_the_previous_reservation() {
    let cluster = ClusterHandle::new();
    let a = Service::start(
        &test_config(15700, 2),
        Box::new(InMemoryConsensus::new(cluster.clone())),
        Box::new(SystemClockSource::default()),
    )
    .expect("start a");
    retry_batch(a.handle(), 0, 10);
    a.stop().expect("stop a");

    // the reservation outlives the instance
    let threshold = cluster.reserved_time_threshold();
    assert!(threshold > 0);

    let b = Service::start(
        &test_config(15750, 2),
        Box::new(InMemoryConsensus::new(cluster.clone())),
        Box::new(SystemClockSource::default()),
    )
    .expect("start b");
    match b.handle().master_url().expect("master url") {
        MasterView::Master { .. } => {}
        other => panic!("expected new master, got {other:?}"),
    }

    // while still inside the old reservation every request is rejected
    if system_tai_now_ns() < threshold {
        assert!(matches!(
            b.handle().timestamp_batch(0, 10),
            Err(WorkerError::NotReady)
        ));
    }

    let batch = retry_batch_for(b.handle(), 0, 10, Duration::from_secs(2));
    assert!(
        batch.tbe_base > threshold,
        "first timestamp {} inside the previous reservation {}",
        batch.tbe_base,
        threshold
    );

    b.stop().expect("stop b");
}
