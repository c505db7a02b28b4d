use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use basalt::authentication::{AuthError, AuthExchange, Authenticator, PasswordAuthenticator};
use basalt::errors::CriticalErrorKind;
use basalt::frame::response::error::DbError;
use basalt_test_node::{HandshakeBehavior, MockNode};

use crate::utils::{
    new_manager, setup_tracing, test_settings, wait_until, PoolEvent, WAIT,
};

#[tokio::test]
async fn critical_auth_error_is_surfaced_once_and_not_retried() {
    setup_tracing();
    let node = MockNode::new()
        .with_handshake(HandshakeBehavior::RequireAuthentication {
            expected_response: Some(b"\0cassandra\0correcthorse".to_vec()),
            challenge: None,
        })
        .start()
        .await
        .unwrap();
    let address = node.address();

    let mut settings = test_settings(2, Duration::from_millis(50));
    settings.connection.authenticator = Some(Arc::new(PasswordAuthenticator::new(
        "cassandra",
        "wrongpassword",
    )));
    let (manager, listener) = new_manager(settings);
    let metrics = manager.metrics().clone();

    manager.add(address);
    wait_until("critical error reported", WAIT, || {
        !listener.events().is_empty()
    })
    .await;

    assert_eq!(
        listener.events(),
        vec![PoolEvent::CriticalError(address, CriticalErrorKind::Auth)]
    );
    assert!(manager.available().is_empty());

    // No pool, no reconnect loop: the address stays dead until the
    // topology layer re-adds it.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(metrics.get_reconnect_attempts(), 0);
    assert_eq!(
        listener.events(),
        vec![PoolEvent::CriticalError(address, CriticalErrorKind::Auth)]
    );
}

#[tokio::test]
async fn missing_authenticator_is_a_critical_auth_error() {
    setup_tracing();
    let node = MockNode::new()
        .with_handshake(HandshakeBehavior::RequireAuthentication {
            expected_response: None,
            challenge: None,
        })
        .start()
        .await
        .unwrap();
    let address = node.address();

    let (manager, listener) = new_manager(test_settings(1, Duration::from_millis(50)));
    manager.add(address);

    wait_until("critical error reported", WAIT, || {
        !listener.events().is_empty()
    })
    .await;
    assert_eq!(
        listener.events(),
        vec![PoolEvent::CriticalError(address, CriticalErrorKind::Auth)]
    );
    assert!(manager.available().is_empty());
}

struct TwoStepAuthenticator;

struct TwoStepExchange;

#[async_trait]
impl AuthExchange for TwoStepExchange {
    async fn next_token(&mut self, challenge: Option<&[u8]>) -> Result<Option<Vec<u8>>, AuthError> {
        match challenge {
            None => Ok(Some(b"step1".to_vec())),
            Some(token) => {
                assert_eq!(token, b"prove-it");
                Ok(Some(b"step2".to_vec()))
            }
        }
    }
}

#[async_trait]
impl Authenticator for TwoStepAuthenticator {
    async fn begin_exchange(
        &self,
        _authenticator_name: &str,
    ) -> Result<Box<dyn AuthExchange>, AuthError> {
        Ok(Box::new(TwoStepExchange))
    }
}

#[tokio::test]
async fn sasl_challenge_round_is_played_out() {
    setup_tracing();
    let node = MockNode::new()
        .with_handshake(HandshakeBehavior::RequireAuthentication {
            expected_response: Some(b"step2".to_vec()),
            challenge: Some(b"prove-it".to_vec()),
        })
        .start()
        .await
        .unwrap();
    let address = node.address();

    let mut settings = test_settings(1, Duration::from_millis(50));
    settings.connection.authenticator = Some(Arc::new(TwoStepAuthenticator));
    let (manager, listener) = new_manager(settings);

    manager.add(address);
    wait_until("pool up", WAIT, || manager.available().contains(&address)).await;
    assert_eq!(listener.events(), vec![PoolEvent::Up(address)]);
}

#[tokio::test]
async fn flap_reports_down_then_up_exactly_once() {
    setup_tracing();
    let node = MockNode::new().start().await.unwrap();
    let address = node.address();

    let (manager, listener) = new_manager(test_settings(2, Duration::from_millis(50)));
    manager.add(address);
    wait_until("pool up", WAIT, || manager.available().contains(&address)).await;
    wait_until("both connections open", WAIT, || node.connection_count() == 2).await;

    node.drop_all_connections();
    wait_until("pool down", WAIT, || {
        listener.events().contains(&PoolEvent::Down(address))
    })
    .await;

    // Within the reconnect window the pool recovers, reporting UP exactly
    // once no matter how many connections come back.
    wait_until("pool up again", WAIT, || {
        listener.events()
            == vec![
                PoolEvent::Up(address),
                PoolEvent::Down(address),
                PoolEvent::Up(address),
            ]
    })
    .await;
    wait_until("pool refilled", WAIT, || node.connection_count() == 2).await;
    assert!(manager.available().contains(&address));
}

#[tokio::test]
async fn critical_reconnect_failure_gives_up_on_the_pool() {
    setup_tracing();
    let node = MockNode::new().start().await.unwrap();
    let address = node.address();

    let (manager, listener) = new_manager(test_settings(1, Duration::from_millis(50)));
    let metrics = manager.metrics().clone();

    manager.add(address);
    wait_until("pool up", WAIT, || manager.available().contains(&address)).await;

    // The node turns hostile: connections die and every new handshake is
    // refused with an authentication error.
    node.set_handshake(HandshakeBehavior::RejectStartup {
        error: DbError::AuthenticationError,
        message: "authentication required".to_owned(),
    });
    node.drop_all_connections();

    wait_until("critical error reported", WAIT, || {
        listener
            .events()
            .contains(&PoolEvent::CriticalError(address, CriticalErrorKind::Auth))
    })
    .await;
    wait_until("pool removed", WAIT, || manager.available().is_empty()).await;

    assert_eq!(
        listener.events(),
        vec![
            PoolEvent::Up(address),
            PoolEvent::Down(address),
            PoolEvent::CriticalError(address, CriticalErrorKind::Auth),
        ]
    );

    // The slot is abandoned: no further reconnect attempts.
    let attempts = metrics.get_reconnect_attempts();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(metrics.get_reconnect_attempts(), attempts);
}
