//! Session coordinator behavior against fake backend and marker.
//!
//! Verifies:
//! - Sessions run to their benchmark duration and report `stop`
//! - A newer start preempts the running session, which reports `term`
//! - Concurrent starts never overlap captures
//! - The token is released on every failure path

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use benchlog::{ContentionSampling, MarkerVerb, ProfileKind, SessionError, SessionState};
use common::Harness;

const LONG: Duration = Duration::from_secs(60);
const SHORT: Duration = Duration::from_millis(100);

/// Fail instead of hanging when the token is never released.
async fn within<F: std::future::Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), fut)
        .await
        .expect("timed out waiting for the coordinator")
}

fn call(verb: MarkerVerb, id: &str) -> (MarkerVerb, String) {
    (verb, id.to_string())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_session_runs_to_completion() {
    let h = Harness::new();

    let handle = h.coordinator.start("sess-1", SHORT).await.unwrap();
    assert_eq!(handle.id(), "sess-1");
    assert_eq!(
        h.coordinator.state(),
        SessionState::Running {
            id: "sess-1".to_string()
        }
    );

    let report = within(handle.wait()).await.unwrap();
    assert_eq!(report.id, "sess-1");
    assert!(!report.terminated_early);
    assert_eq!(report.verb, MarkerVerb::Stop);
    assert!(report.elapsed >= SHORT);
    assert!(report.elapsed < SHORT + Duration::from_secs(1), "{:?}", report.elapsed);

    assert_eq!(report.artifacts.len(), 1 + ProfileKind::ALL.len());
    assert_eq!(report.artifacts[0], h.artifact("cpu.prof"));
    for kind in ProfileKind::ALL {
        let contents = std::fs::read_to_string(h.artifact(&kind.file_name())).unwrap();
        assert_eq!(contents, format!("fake {kind}\n"));
    }
    assert!(!h.artifact("trace.prof").exists());

    assert_eq!(
        h.marker.calls(),
        vec![call(MarkerVerb::Start, "sess-1"), call(MarkerVerb::Stop, "sess-1")]
    );
    assert_eq!(h.coordinator.state(), SessionState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_newer_start_preempts_running_session() {
    let h = Harness::new();

    let first = h.coordinator.start("sess-1", LONG).await.unwrap();
    let second = within(h.coordinator.start("sess-2", LONG)).await.unwrap();

    let first_report = within(first.wait()).await.unwrap();
    assert!(first_report.terminated_early);
    assert_eq!(first_report.verb, MarkerVerb::Term);
    assert_eq!(
        h.coordinator.state(),
        SessionState::Running {
            id: "sess-2".to_string()
        }
    );

    assert!(h.coordinator.request_stop());
    let second_report = within(second.wait()).await.unwrap();
    assert_eq!(second_report.verb, MarkerVerb::Term);

    assert_eq!(
        h.marker.calls(),
        vec![
            call(MarkerVerb::Start, "sess-1"),
            call(MarkerVerb::Term, "sess-1"),
            call(MarkerVerb::Start, "sess-2"),
            call(MarkerVerb::Term, "sess-2"),
        ]
    );
    assert_eq!(h.backend().max_active_cpu(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_starts_never_overlap() {
    let h = Harness::new();

    let starts: Vec<_> = (0..8)
        .map(|i| {
            let coordinator = h.coordinator.clone();
            tokio::spawn(async move { coordinator.start(format!("sess-{i}"), SHORT).await })
        })
        .collect();

    let mut reports = Vec::new();
    for start in starts {
        let handle = within(start).await.unwrap().unwrap();
        reports.push(within(handle.wait()).await.unwrap());
    }

    assert_eq!(reports.len(), 8);
    assert_eq!(h.backend().cpu_begun(), 8);
    assert_eq!(h.backend().max_active_cpu(), 1);

    // Every start is followed by that same session's stop or term
    let calls = h.marker.calls();
    assert_eq!(calls.len(), 16);
    for pair in calls.chunks(2) {
        assert_eq!(pair[0].0, MarkerVerb::Start);
        assert!(matches!(pair[1].0, MarkerVerb::Stop | MarkerVerb::Term));
        assert_eq!(pair[0].1, pair[1].1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stale_stop_is_discarded_after_acquisition() {
    let h = Harness::new();

    let first = h.coordinator.start("sess-1", LONG).await.unwrap();
    let second = within(h.coordinator.start("sess-2", Duration::from_millis(200)))
        .await
        .unwrap();

    assert!(within(first.wait()).await.unwrap().terminated_early);

    // Stops posted while sess-1 was finalizing must not cut sess-2 short
    let report = within(second.wait()).await.unwrap();
    assert!(!report.terminated_early);
    assert_eq!(report.verb, MarkerVerb::Stop);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_request_stop_when_idle() {
    let h = Harness::new();
    assert!(!h.coordinator.request_stop());

    // Nothing was queued, so the next session runs its full duration
    let report = within(h.coordinator.start("sess-1", SHORT).await.unwrap().wait())
        .await
        .unwrap();
    assert_eq!(report.verb, MarkerVerb::Stop);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_during_marker_start_terminates_session() {
    let h = Harness::new();
    h.marker.start_delay_ms.store(200, Ordering::SeqCst);

    let coordinator = h.coordinator.clone();
    let starting = tokio::spawn(async move { coordinator.start("sess-1", LONG).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.coordinator.state(), SessionState::Idle);
    assert!(h.coordinator.request_stop());

    let handle = within(starting).await.unwrap().unwrap();
    let report = within(handle.wait()).await.unwrap();
    assert!(report.terminated_early);
    assert_eq!(report.verb, MarkerVerb::Term);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_abandoned_start_still_finalizes() {
    let h = Harness::new();
    h.marker.start_delay_ms.store(200, Ordering::SeqCst);

    // Caller gives up while the marker is still handling `start`
    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        h.coordinator.start("sess-1", SHORT),
    )
    .await;
    assert!(abandoned.is_err());

    within(async {
        while h.marker.calls().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert_eq!(
        h.marker.calls(),
        vec![call(MarkerVerb::Start, "sess-1"), call(MarkerVerb::Stop, "sess-1")]
    );
    assert_eq!(h.backend().cpu_begun(), 1);

    let mut states = h.coordinator.subscribe();
    within(states.wait_for(|s| *s == SessionState::Idle))
        .await
        .unwrap();

    // Token is free again
    let report = within(h.coordinator.start("sess-2", SHORT).await.unwrap().wait())
        .await
        .unwrap();
    assert_eq!(report.verb, MarkerVerb::Stop);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_marker_start_failure_releases_token() {
    let h = Harness::new();
    h.marker.fail_start.store(true, Ordering::SeqCst);

    let err = h.coordinator.start("sess-1", SHORT).await.unwrap_err();
    assert!(matches!(err, SessionError::MarkerStart { ref id, .. } if id == "sess-1"));
    assert_eq!(h.backend().cpu_begun(), 0);
    assert_eq!(h.coordinator.state(), SessionState::Idle);

    h.marker.fail_start.store(false, Ordering::SeqCst);
    let report = within(h.coordinator.start("sess-2", SHORT).await.unwrap().wait())
        .await
        .unwrap();
    assert_eq!(report.id, "sess-2");
}

#[tokio::test]
async fn test_captures_begin_off_the_runtime_thread() {
    let h = Harness::new();
    let runtime_thread = std::thread::current().id();

    let report = within(h.coordinator.start("sess-1", SHORT).await.unwrap().wait())
        .await
        .unwrap();
    assert_eq!(report.verb, MarkerVerb::Stop);

    let threads = h.backend().cpu_threads();
    assert_eq!(threads.len(), 1);
    assert_ne!(threads[0], runtime_thread);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_capture_failure_reports_term() {
    let h = Harness::new();
    h.backend().fail_begin_cpu.store(true, Ordering::SeqCst);

    let err = h.coordinator.start("sess-1", SHORT).await.unwrap_err();
    assert!(matches!(err, SessionError::Capture { .. }));
    assert_eq!(
        h.marker.calls(),
        vec![call(MarkerVerb::Start, "sess-1"), call(MarkerVerb::Term, "sess-1")]
    );

    h.backend().fail_begin_cpu.store(false, Ordering::SeqCst);
    assert!(within(h.coordinator.start("sess-2", SHORT)).await.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_artifact_failure_is_returned_and_releases_token() {
    let h = Harness::new();
    h.backend().fail_dump.store(true, Ordering::SeqCst);

    let handle = h.coordinator.start("sess-1", SHORT).await.unwrap();
    let err = within(handle.wait()).await.unwrap_err();
    assert!(matches!(err, SessionError::Artifact { ref id, .. } if id == "sess-1"));

    // No stop or term for a session whose artifacts failed
    assert_eq!(h.marker.calls(), vec![call(MarkerVerb::Start, "sess-1")]);
    assert_eq!(h.coordinator.state(), SessionState::Idle);

    h.backend().fail_dump.store(false, Ordering::SeqCst);
    let report = within(h.coordinator.start("sess-2", SHORT).await.unwrap().wait())
        .await
        .unwrap();
    assert_eq!(report.verb, MarkerVerb::Stop);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_panicking_backend_releases_token() {
    let h = Harness::new();
    h.backend().panic_dump.store(true, Ordering::SeqCst);

    let handle = h.coordinator.start("sess-1", SHORT).await.unwrap();
    let err = within(handle.wait()).await.unwrap_err();
    assert!(matches!(err, SessionError::Panicked { .. }));

    h.backend().panic_dump.store(false, Ordering::SeqCst);
    assert!(within(h.coordinator.start("sess-2", SHORT)).await.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_marker_stop_failure_is_not_fatal() {
    let h = Harness::new();
    h.marker.fail_stop.store(true, Ordering::SeqCst);

    let report = within(h.coordinator.start("sess-1", SHORT).await.unwrap().wait())
        .await
        .unwrap();
    assert_eq!(report.verb, MarkerVerb::Stop);
    assert_eq!(report.artifacts.len(), 1 + ProfileKind::ALL.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_trace_artifact_when_enabled() {
    let h = Harness::with_config(|config| config.trace = true);

    let report = within(h.coordinator.start("sess-1", SHORT).await.unwrap().wait())
        .await
        .unwrap();
    assert_eq!(report.artifacts.last(), Some(&h.artifact("trace.prof")));
    assert_eq!(
        std::fs::read_to_string(h.artifact("trace.prof")).unwrap(),
        "fake trace\n"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_contention_sampling_applied_every_session() {
    let h = Harness::with_config(|config| config.contention_sampling = ContentionSampling::Off);

    for id in ["sess-1", "sess-2"] {
        within(h.coordinator.start(id, SHORT).await.unwrap().wait())
            .await
            .unwrap();
    }
    assert_eq!(
        h.backend().contention_calls(),
        vec![ContentionSampling::Off, ContentionSampling::Off]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_start_next_uses_marker_id() {
    let h = Harness::new();

    let handle = h.coordinator.start_next(SHORT).await.unwrap();
    assert_eq!(handle.id(), "sess-1");
    within(handle.wait()).await.unwrap();

    let handle = h.coordinator.start_next(SHORT).await.unwrap();
    assert_eq!(handle.id(), "sess-2");
    within(handle.wait()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_state_transitions_are_observable() {
    let h = Harness::new();
    let mut states = h.coordinator.subscribe();
    assert_eq!(*states.borrow_and_update(), SessionState::Idle);

    let handle = h.coordinator.start("sess-1", LONG).await.unwrap();
    assert!(states.has_changed().unwrap());
    assert_eq!(
        *states.borrow_and_update(),
        SessionState::Running {
            id: "sess-1".to_string()
        }
    );

    assert!(h.coordinator.request_stop());
    within(handle.wait()).await.unwrap();
    assert_eq!(*states.borrow_and_update(), SessionState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_finalizes_and_refuses_new_sessions() {
    let h = Harness::new();

    let handle = h.coordinator.start("sess-1", LONG).await.unwrap();
    within(h.coordinator.shutdown()).await.unwrap();

    let report = within(handle.wait()).await.unwrap();
    assert_eq!(report.verb, MarkerVerb::Term);

    assert!(matches!(
        h.coordinator.start("sess-2", SHORT).await,
        Err(SessionError::Closed)
    ));
    within(h.coordinator.shutdown()).await.unwrap();
}
