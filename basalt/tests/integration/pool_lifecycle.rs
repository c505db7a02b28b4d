use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

use basalt::frame::response::ResponseOpcode;
use basalt_test_node::MockNode;

use crate::utils::{
    assert_alternating_liveness, drain_queries, new_manager, query_frame, setup_tracing,
    test_settings, wait_until, PoolEvent, WAIT,
};

#[tokio::test]
async fn pool_comes_up_and_delivers_writes() {
    setup_tracing();
    let (feedback_sender, mut feedback) = mpsc::unbounded_channel();
    let node = MockNode::new()
        .with_request_feedback(feedback_sender)
        .start()
        .await
        .unwrap();
    let address = node.address();

    let (manager, listener) = new_manager(test_settings(2, Duration::from_millis(50)));
    manager.add(address);

    wait_until("pool up", WAIT, || manager.available().contains(&address)).await;
    assert_eq!(listener.events(), vec![PoolEvent::Up(address)]);
    wait_until("both connections open", WAIT, || node.connection_count() == 2).await;

    let connection = manager.find_least_busy(address).expect("a connection");
    let (response_sender, response_receiver) = oneshot::channel();
    connection
        .write(query_frame("SELECT host_id FROM system.local"), response_sender)
        .unwrap();

    // Nothing hits the socket until the next flush tick.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(drain_queries(&mut feedback).is_empty());

    manager.flush();
    let response = tokio::time::timeout(WAIT, response_receiver)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(response.opcode, ResponseOpcode::Result);
    assert_eq!(
        drain_queries(&mut feedback),
        vec!["SELECT host_id FROM system.local".to_owned()]
    );
}

#[tokio::test]
async fn partial_success_still_comes_up_and_refills() {
    setup_tracing();
    let node = MockNode::new()
        .with_connection_limit(2)
        .start()
        .await
        .unwrap();
    let address = node.address();

    let (manager, listener) = new_manager(test_settings(4, Duration::from_millis(50)));
    let metrics = manager.metrics().clone();

    manager.add(address);
    wait_until("pool up", WAIT, || manager.available().contains(&address)).await;
    assert_eq!(listener.events(), vec![PoolEvent::Up(address)]);
    assert_eq!(node.connection_count(), 2);

    // The two slots that could not connect keep retrying on the reconnect
    // cadence, and the pool stays up while they do.
    wait_until("reconnects attempted", WAIT, || {
        metrics.get_reconnect_attempts() >= 2
    })
    .await;
    assert!(manager.available().contains(&address));

    // Once the node has room again, the retries fill the pool.
    node.set_connection_limit(None);
    wait_until("pool filled", WAIT, || node.connection_count() == 4).await;
    assert_eq!(listener.events(), vec![PoolEvent::Up(address)]);
}

#[tokio::test]
async fn duplicate_add_is_ignored() {
    setup_tracing();
    let node = MockNode::new().start().await.unwrap();
    let address = node.address();

    let (manager, listener) = new_manager(test_settings(2, Duration::from_millis(50)));
    manager.add(address);
    manager.add(address);

    wait_until("pool up", WAIT, || manager.available().contains(&address)).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(node.connection_count(), 2);
    assert_eq!(listener.events(), vec![PoolEvent::Up(address)]);
    assert_eq!(manager.available(), vec![address]);
}

#[tokio::test]
async fn remove_closes_the_pool() {
    setup_tracing();
    let node = MockNode::new().start().await.unwrap();
    let address = node.address();

    let (manager, listener) = new_manager(test_settings(2, Duration::from_millis(50)));
    manager.add(address);
    wait_until("pool up", WAIT, || manager.available().contains(&address)).await;

    manager.remove(address);
    wait_until("pool removed", WAIT, || manager.available().is_empty()).await;
    wait_until("sockets closed", WAIT, || node.connection_count() == 0).await;
    assert_eq!(
        listener.events(),
        vec![PoolEvent::Up(address), PoolEvent::Down(address)]
    );

    // Removing an unknown address is a no-op.
    manager.remove(address);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        listener.events(),
        vec![PoolEvent::Up(address), PoolEvent::Down(address)]
    );
}

#[tokio::test]
async fn add_remove_interleavings_keep_liveness_alternating() {
    setup_tracing();
    let node = MockNode::new().start().await.unwrap();
    let address = node.address();

    let (manager, listener) = new_manager(test_settings(1, Duration::from_millis(50)));

    for _ in 0..5 {
        manager.add(address);
        manager.remove(address);
    }
    manager.add(address);

    wait_until("pool up", WAIT, || manager.available().contains(&address)).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_alternating_liveness(&listener.events(), address);
    assert_eq!(manager.available(), vec![address]);
}

#[tokio::test]
async fn orderly_close_with_pending_connector() {
    setup_tracing();
    let node_a = MockNode::new().start().await.unwrap();
    let node_b = MockNode::new().start().await.unwrap();

    // A socket that accepts but never answers keeps its pool connector
    // pending until close cancels it.
    let black_hole = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let black_hole_address = black_hole.local_addr().unwrap();
    let _hole = tokio::spawn(async move {
        let mut sockets = Vec::new();
        loop {
            let (socket, _) = black_hole.accept().await.unwrap();
            sockets.push(socket);
        }
    });

    let (manager, listener) = new_manager(test_settings(2, Duration::from_millis(50)));
    manager.add(node_a.address());
    manager.add(node_b.address());
    wait_until("both pools up", WAIT, || manager.available().len() == 2).await;

    manager.add(black_hole_address);
    tokio::time::sleep(Duration::from_millis(100)).await;

    manager.close();
    wait_until("manager closed", WAIT, || {
        listener.events().last() == Some(&PoolEvent::Close)
    })
    .await;

    let events = listener.events();
    assert_eq!(
        events.iter().filter(|e| **e == PoolEvent::Close).count(),
        1
    );
    for address in [node_a.address(), node_b.address()] {
        assert!(events.contains(&PoolEvent::Down(address)));
    }
    assert!(manager.available().is_empty());
    wait_until("sockets closed", WAIT, || {
        node_a.connection_count() == 0 && node_b.connection_count() == 0
    })
    .await;

    // No listener call arrives after on_close; repeated close is a no-op.
    manager.close();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(listener.events(), events);
}

#[tokio::test]
async fn dropping_the_last_handle_closes_the_manager() {
    setup_tracing();
    let node = MockNode::new().start().await.unwrap();
    let address = node.address();

    let (manager, listener) = new_manager(test_settings(1, Duration::from_millis(50)));
    manager.add(address);
    wait_until("pool up", WAIT, || manager.available().contains(&address)).await;

    drop(manager);
    wait_until("manager closed", WAIT, || {
        listener.events().last() == Some(&PoolEvent::Close)
    })
    .await;
    wait_until("sockets closed", WAIT, || node.connection_count() == 0).await;
}
