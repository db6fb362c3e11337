//! Replication scenarios against fake endpoints and a scripted helper.

mod support;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use mfr_tools_mfr::endpoint::{EndpointKind, StorageEndpoint};
use mfr_tools_mfr::scheduler::{self, ReplicateError};
use mfr_tools_mfr::StopSignal;
use support::{Behavior, FakeEndpoint, Helper};

fn endpoints(
    outbound: usize,
    inbound: usize,
) -> (Arc<FakeEndpoint>, Arc<FakeEndpoint>) {
    (
        Arc::new(FakeEndpoint::new(EndpointKind::Local, outbound, 4)),
        Arc::new(FakeEndpoint::new(EndpointKind::Remote, 4, inbound)),
    )
}

fn as_dyn(endpoint: &Arc<FakeEndpoint>) -> Arc<dyn StorageEndpoint> {
    endpoint.clone()
}

#[tokio::test]
#[tracing_test::traced_test]
async fn all_files_replicated_within_cap() {
    let files: Vec<_> = (1..=6)
        .map(|i| (support::file(i, 1000 * i as u64), Behavior::Ok))
        .collect();
    let set = support::backup_set(&files);
    let helper = Helper::new(&files);
    let (source, dest) = endpoints(4, 4);
    let stop = StopSignal::new();
    let summary = scheduler::replicate(
        &set,
        as_dyn(&source),
        as_dyn(&dest),
        2,
        &stop,
        &helper.settings(),
    )
    .await
    .unwrap();
    assert_eq!(summary.files, 6);
    assert_eq!(summary.bytes, 21000);
    assert!(summary.peak_streams >= 1 && summary.peak_streams <= 2);
    assert!(helper.max_concurrency() <= 2);
    assert_eq!(helper.started().len(), 6);
    assert!(dest.deleted().is_empty());
}

#[tokio::test]
async fn files_start_in_set_order() {
    let files: Vec<_> = (1..=4)
        .map(|i| (support::file(i, 10), Behavior::Ok))
        .collect();
    let set = support::backup_set(&files);
    let helper = Helper::new(&files);
    let (source, dest) = endpoints(4, 4);
    scheduler::replicate(
        &set,
        as_dyn(&source),
        as_dyn(&dest),
        1,
        &StopSignal::new(),
        &helper.settings(),
    )
    .await
    .unwrap();
    let expected: Vec<_> = set.files().iter().map(|f| f.name.clone()).collect();
    assert_eq!(helper.started(), expected);
    assert_eq!(helper.max_concurrency(), 1);
}

#[tokio::test]
async fn waits_for_live_capacity() {
    let files = vec![(support::file(1, 100), Behavior::Ok)];
    let set = support::backup_set(&files);
    let helper = Helper::new(&files);
    let (source, dest) = endpoints(4, 4);
    // other applications hold every stream of the destination
    dest.in_use.store(4, Ordering::SeqCst);
    let release = {
        let dest = dest.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            dest.in_use.store(0, Ordering::SeqCst);
        })
    };
    let start = std::time::Instant::now();
    let summary = scheduler::replicate(
        &set,
        as_dyn(&source),
        as_dyn(&dest),
        2,
        &StopSignal::new(),
        &helper.settings(),
    )
    .await
    .unwrap();
    release.await.unwrap();
    assert!(start.elapsed() >= std::time::Duration::from_millis(300));
    assert_eq!(summary.files, 1);
    assert_eq!(summary.peak_streams, 1);
}

#[tokio::test]
#[tracing_test::traced_test]
async fn failed_transfer_aborts_and_cleans_up() {
    let files = vec![
        (support::file(1, 100), Behavior::Fail),
        (support::file(2, 100), Behavior::Hang),
        (support::file(3, 100), Behavior::Ok),
        (support::file(4, 100), Behavior::Ok),
    ];
    let set = support::backup_set(&files);
    let helper = Helper::new(&files);
    let (source, dest) = endpoints(4, 4);
    let stop = StopSignal::new();
    let error = scheduler::replicate(
        &set,
        as_dyn(&source),
        as_dyn(&dest),
        2,
        &stop,
        &helper.settings(),
    )
    .await
    .unwrap_err();
    assert!(
        matches!(error, ReplicateError::Aborted { .. }),
        "{error:?}"
    );
    assert!(stop.is_stopped());
    // the failed file may be partially written, the canceled one was removed by the helper
    assert_eq!(dest.deleted(), vec![support::dest_path(&files[0].0)]);
    assert_eq!(helper.started().len(), 2);
}

#[tokio::test]
async fn cancel_stops_running_transfers() {
    let files: Vec<_> = (1..=5)
        .map(|i| (support::file(i, 100), Behavior::Hang))
        .collect();
    let set = support::backup_set(&files);
    let helper = Helper::new(&files);
    let (source, dest) = endpoints(4, 4);
    let stop = StopSignal::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            stop.cancel();
        });
    }
    let error = tokio::time::timeout(
        std::time::Duration::from_secs(10),
        scheduler::replicate(
            &set,
            as_dyn(&source),
            as_dyn(&dest),
            3,
            &stop,
            &helper.settings(),
        ),
    )
    .await
    .unwrap()
    .unwrap_err();
    assert!(matches!(error, ReplicateError::Canceled { .. }), "{error:?}");
    assert_eq!(helper.started().len(), 3);
    assert!(dest.deleted().is_empty());
}

#[tokio::test]
async fn watchdog_kills_helpers_ignoring_interrupts() {
    let files = vec![(support::file(1, 100), Behavior::Stubborn)];
    let set = support::backup_set(&files);
    let helper = Helper::new(&files);
    let (source, dest) = endpoints(4, 4);
    let stop = StopSignal::new();
    let settings = scheduler::Settings {
        watchdog: std::time::Duration::from_millis(500),
        ..helper.settings()
    };
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            stop.cancel();
        });
    }
    let start = std::time::Instant::now();
    let error = tokio::time::timeout(
        std::time::Duration::from_secs(10),
        scheduler::replicate(&set, as_dyn(&source), as_dyn(&dest), 1, &stop, &settings),
    )
    .await
    .unwrap()
    .unwrap_err();
    assert!(matches!(error, ReplicateError::Canceled { .. }), "{error:?}");
    assert!(start.elapsed() >= std::time::Duration::from_millis(700));
    assert!(dest.deleted().is_empty());
}

#[tokio::test]
async fn stop_before_start_spawns_nothing() {
    let files = vec![(support::file(1, 100), Behavior::Ok)];
    let set = support::backup_set(&files);
    let helper = Helper::new(&files);
    let (source, dest) = endpoints(4, 4);
    let stop = StopSignal::new();
    stop.cancel();
    let error = scheduler::replicate(
        &set,
        as_dyn(&source),
        as_dyn(&dest),
        1,
        &stop,
        &helper.settings(),
    )
    .await
    .unwrap_err();
    assert!(matches!(error, ReplicateError::Canceled { .. }));
    assert!(helper.started().is_empty());
}

#[tokio::test]
async fn cap_above_ceiling_is_rejected() {
    let files = vec![(support::file(1, 100), Behavior::Ok)];
    let set = support::backup_set(&files);
    let helper = Helper::new(&files);
    for (outbound, inbound, expected) in [(4, 8, "local(dd-local)"), (8, 4, "remote(dd-remote)")] {
        let (source, dest) = endpoints(outbound, inbound);
        let error = scheduler::replicate(
            &set,
            as_dyn(&source),
            as_dyn(&dest),
            5,
            &StopSignal::new(),
            &helper.settings(),
        )
        .await
        .unwrap_err();
        match error {
            ReplicateError::Validation(message) => assert!(message.contains(expected), "{message}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
    let (source, dest) = endpoints(4, 4);
    let error = scheduler::replicate(
        &set,
        as_dyn(&source),
        as_dyn(&dest),
        0,
        &StopSignal::new(),
        &helper.settings(),
    )
    .await
    .unwrap_err();
    assert!(matches!(error, ReplicateError::Validation(_)));
    assert!(helper.started().is_empty());
}

#[tokio::test]
async fn same_kind_endpoints_are_rejected() {
    let files = vec![(support::file(1, 100), Behavior::Ok)];
    let set = support::backup_set(&files);
    let helper = Helper::new(&files);
    let source = Arc::new(FakeEndpoint::new(EndpointKind::Local, 4, 4));
    let dest = Arc::new(FakeEndpoint::new(EndpointKind::Local, 4, 4));
    let error = scheduler::replicate(
        &set,
        as_dyn(&source),
        as_dyn(&dest),
        1,
        &StopSignal::new(),
        &helper.settings(),
    )
    .await
    .unwrap_err();
    assert!(matches!(error, ReplicateError::Validation(_)));
    assert!(helper.started().is_empty());
}
