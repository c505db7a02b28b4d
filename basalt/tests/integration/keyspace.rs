use std::time::Duration;

use tokio::sync::mpsc;

use basalt::errors::CriticalErrorKind;
use basalt::frame::response::error::DbError;
use basalt_test_node::{MockNode, QueryBehavior};

use crate::utils::{
    drain_queries, new_manager, new_manager_with_keyspace, setup_tracing, test_settings,
    wait_until, PoolEvent, WAIT,
};

#[tokio::test(flavor = "multi_thread")]
async fn keyspace_updates_race_safely_across_threads() {
    setup_tracing();
    let (feedback_sender, mut feedback) = mpsc::unbounded_channel();
    let node = MockNode::new()
        .with_request_feedback(feedback_sender)
        .start()
        .await
        .unwrap();
    let address = node.address();

    let (manager, _listener) = new_manager(test_settings(1, Duration::from_millis(50)));

    // Hammer the keyspace from two non-loop threads.
    let writer_a = {
        let manager = manager.clone();
        std::thread::spawn(move || {
            for _ in 0..100 {
                manager.set_keyspace("ks_a");
            }
        })
    };
    let writer_b = {
        let manager = manager.clone();
        std::thread::spawn(move || {
            for _ in 0..100 {
                manager.set_keyspace("ks_b");
            }
        })
    };
    writer_a.join().unwrap();
    writer_b.join().unwrap();

    // Last writer wins, with no torn value.
    let current = manager.keyspace();
    assert!(current == "ks_a" || current == "ks_b");

    // A connection opened now picks up whatever was current at its
    // keyspace-setting step.
    manager.add(address);
    wait_until("pool up", WAIT, || manager.available().contains(&address)).await;

    let connection = manager.find_least_busy(address).unwrap();
    assert_eq!(connection.keyspace(), Some(current.as_str()));

    let uses: Vec<String> = drain_queries(&mut feedback)
        .into_iter()
        .filter(|query| query.starts_with("USE "))
        .collect();
    assert_eq!(uses, vec![format!("USE {}", current)]);
}

#[tokio::test]
async fn set_keyspace_applies_to_new_connections_only() {
    setup_tracing();
    let node = MockNode::new().start().await.unwrap();
    let address = node.address();

    let (manager, listener) =
        new_manager_with_keyspace(test_settings(1, Duration::from_millis(50)), "ks_initial");

    manager.add(address);
    wait_until("pool up", WAIT, || manager.available().contains(&address)).await;

    let connection = manager.find_least_busy(address).unwrap();
    assert_eq!(connection.keyspace(), Some("ks_initial"));

    // Existing connections are not migrated.
    manager.set_keyspace("ks_next");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(connection.keyspace(), Some("ks_initial"));

    // A replacement connection picks the new keyspace up during setup.
    node.drop_all_connections();
    wait_until("pool recovered", WAIT, || {
        listener.events().last() == Some(&PoolEvent::Up(address))
            && listener.events().len() == 3
    })
    .await;

    let replacement = manager.find_least_busy(address).unwrap();
    assert_eq!(replacement.keyspace(), Some("ks_next"));
}

#[tokio::test]
async fn failed_use_is_a_critical_keyspace_error() {
    setup_tracing();
    let node = MockNode::new()
        .with_query_behavior(QueryBehavior::ForgeError {
            error: DbError::Invalid,
            message: "Keyspace 'missing_ks' does not exist".to_owned(),
        })
        .start()
        .await
        .unwrap();
    let address = node.address();

    let (manager, listener) =
        new_manager_with_keyspace(test_settings(1, Duration::from_millis(50)), "missing_ks");

    manager.add(address);
    wait_until("critical error reported", WAIT, || {
        !listener.events().is_empty()
    })
    .await;

    assert_eq!(
        listener.events(),
        vec![PoolEvent::CriticalError(
            address,
            CriticalErrorKind::Keyspace
        )]
    );
    assert!(manager.available().is_empty());
}
