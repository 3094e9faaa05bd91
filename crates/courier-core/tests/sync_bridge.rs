use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use courier_core::execution::ExecutionTask;
use courier_core::invocation::{InvocationCallback, InvocationResultCallback, SyncInvocation};
use serde_json::json;

fn counting_listener(bridge: &SyncInvocation) -> Arc<AtomicUsize> {
    let calls = Arc::new(AtomicUsize::new(0));
    bridge.add_cancel_listener(Arc::new({
        let calls = calls.clone();
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
        }
    }));
    calls
}

#[test]
fn cancel_completes_with_cancelled_and_notifies_listeners_once() {
    let bridge = SyncInvocation::new();
    let calls = counting_listener(&bridge);

    bridge.cancel();
    bridge.cancel();
    bridge.finished(json!("late"));

    assert!(bridge.is_done());
    assert!(bridge.result_sync(None).unwrap_err().is_cancelled());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn listener_added_after_cancel_fires_immediately() {
    let bridge = SyncInvocation::new();
    bridge.cancel();

    let calls = counting_listener(&bridge);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    bridge.cancel();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn cancel_after_result_keeps_the_result() {
    let bridge = SyncInvocation::new();
    bridge.finished(json!(7));
    bridge.cancel();

    assert_eq!(bridge.result_sync(Some(Duration::from_millis(10))).unwrap(), json!(7));
}

#[test]
fn canceling_a_linked_execution_cancels_the_bridge() {
    let bridge = Arc::new(SyncInvocation::new());
    let calls = counting_listener(&bridge);
    let task = ExecutionTask::new();
    bridge.link_execution(&task);

    let waiter = std::thread::spawn({
        let bridge = bridge.clone();
        move || bridge.result_sync(Some(Duration::from_secs(2)))
    });
    std::thread::sleep(Duration::from_millis(20));
    task.cancel();

    assert!(waiter.join().unwrap().unwrap_err().is_cancelled());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn finishing_a_linked_execution_does_not_cancel() {
    let bridge = Arc::new(SyncInvocation::new());
    let task = ExecutionTask::new();
    bridge.link_execution(&task);

    task.finished();
    assert!(!bridge.is_done());
}
