use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use tokio::sync::{mpsc, oneshot};

use basalt::errors::WriteError;
use basalt::frame::response::ResponseOpcode;
use basalt_test_node::MockNode;

use crate::utils::{
    drain_queries, flush_soon, new_manager, query_frame, setup_tracing, test_settings, wait_until,
    WAIT,
};

#[tokio::test]
async fn oversized_writes_are_rejected_without_queueing() {
    setup_tracing();
    let node = MockNode::new().start().await.unwrap();
    let address = node.address();

    let mut settings = test_settings(1, Duration::from_millis(50));
    settings.queue_size_io = 128;
    let (manager, _listener) = new_manager(settings);

    manager.add(address);
    wait_until("pool up", WAIT, || manager.available().contains(&address)).await;

    let connection = manager.find_least_busy(address).unwrap();

    let (response_sender, _response_receiver) = oneshot::channel();
    let oversized = query_frame(&"x".repeat(256));
    assert_matches!(
        connection.write(oversized, response_sender),
        Err(WriteError::WriteQueueFull)
    );

    // A frame that fits is still accepted and delivered.
    let (response_sender, response_receiver) = oneshot::channel();
    connection
        .write(query_frame("SELECT 1"), response_sender)
        .unwrap();
    flush_soon(&manager).await;
    let response = tokio::time::timeout(WAIT, response_receiver)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(response.opcode, ResponseOpcode::Result);
}

#[tokio::test]
async fn stream_ids_exhaust_at_the_protocol_bound() {
    setup_tracing();
    let node = MockNode::new().start().await.unwrap();
    let address = node.address();

    let mut settings = test_settings(1, Duration::from_millis(50));
    settings.queue_size_io = 4 * 1024 * 1024;
    let (manager, _listener) = new_manager(settings);

    manager.add(address);
    wait_until("pool up", WAIT, || manager.available().contains(&address)).await;

    let connection = manager.find_least_busy(address).unwrap();

    // The stream id space of a connection is 15 bits wide.
    let mut receivers = Vec::with_capacity(1 << 15);
    for _ in 0..(1 << 15) {
        let (response_sender, response_receiver) = oneshot::channel();
        connection
            .write(query_frame("SELECT 1"), response_sender)
            .unwrap();
        receivers.push(response_receiver);
    }
    assert_eq!(connection.find_least_busy_score(), 1 << 15);

    let (response_sender, _response_receiver) = oneshot::channel();
    assert_matches!(
        connection.write(query_frame("SELECT 1"), response_sender),
        Err(WriteError::StreamIdsExhausted)
    );
}

#[tokio::test]
async fn writes_preserve_submission_order_per_connection() {
    setup_tracing();
    let (feedback_sender, mut feedback) = mpsc::unbounded_channel();
    let node = MockNode::new()
        .with_request_feedback(feedback_sender)
        .start()
        .await
        .unwrap();
    let address = node.address();

    let (manager, _listener) = new_manager(test_settings(1, Duration::from_millis(50)));
    manager.add(address);
    wait_until("pool up", WAIT, || manager.available().contains(&address)).await;

    let connection = manager.find_least_busy(address).unwrap();

    let expected: Vec<String> = (0..10).map(|i| format!("SELECT {}", i)).collect();
    let mut receivers = Vec::new();
    for query in &expected {
        let (response_sender, response_receiver) = oneshot::channel();
        connection.write(query_frame(query), response_sender).unwrap();
        receivers.push(response_receiver);
    }

    // A single flush drains the whole batch, in submission order.
    flush_soon(&manager).await;
    for receiver in receivers {
        let response = tokio::time::timeout(WAIT, receiver)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(response.opcode, ResponseOpcode::Result);
    }
    assert_eq!(drain_queries(&mut feedback), expected);
}

#[tokio::test]
async fn selection_prefers_the_idle_connection() {
    setup_tracing();
    let node = MockNode::new().start().await.unwrap();
    let address = node.address();

    let (manager, _listener) = new_manager(test_settings(2, Duration::from_millis(50)));
    manager.add(address);
    wait_until("pool up", WAIT, || manager.available().contains(&address)).await;
    wait_until("both connections open", WAIT, || node.connection_count() == 2).await;

    let first = manager.find_least_busy(address).unwrap();
    let (response_sender, _response_receiver) = oneshot::channel();
    first
        .write(query_frame("SELECT 1"), response_sender)
        .unwrap();

    let second = manager.find_least_busy(address).unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(second.find_least_busy_score(), 0);
    assert_eq!(first.find_least_busy_score(), 1);
}

#[tokio::test]
async fn writes_fail_fast_once_the_connection_closes() {
    setup_tracing();
    let node = MockNode::new().start().await.unwrap();
    let address = node.address();

    let (manager, _listener) = new_manager(test_settings(1, Duration::from_millis(50)));
    manager.add(address);
    wait_until("pool up", WAIT, || manager.available().contains(&address)).await;

    let connection = manager.find_least_busy(address).unwrap();
    manager.remove(address);

    wait_until("writes rejected", WAIT, || {
        let (response_sender, _response_receiver) = oneshot::channel();
        matches!(
            connection.write(query_frame("SELECT 1"), response_sender),
            Err(WriteError::ConnectionClosing)
        )
    })
    .await;

    // The handle is an owned share: it outlives the pool that spawned it.
    wait_until("pool removed", WAIT, || manager.available().is_empty()).await;
    assert_eq!(connection.address(), address);
}

#[tokio::test]
async fn unknown_addresses_have_no_pool() {
    setup_tracing();
    let (manager, _listener) = new_manager(test_settings(1, Duration::from_millis(50)));

    let address = "127.0.0.1:19042".parse().unwrap();
    assert!(manager.find_least_busy(address).is_none());
    assert!(manager.available().is_empty());
}
