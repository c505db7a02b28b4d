use std::borrow::Cow;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use basalt_wire::frame::request::{self, startup, CqlRequestKind};
use basalt_wire::frame::response::authenticate::Authenticate;
use basalt_wire::frame::response::result::CqlResult;
use basalt_wire::frame::response::Response;
use basalt_wire::frame::Compression;

use crate::errors::{
    ConnectionError, ConnectionSetupRequestError, ConnectionSetupRequestErrorKind,
};
use crate::network::connection::{ConnectionConfig, ErrorReceiver, PooledConnection};
use crate::observability::metrics::Metrics;

/// The manager's current keyspace, read by every connector at its
/// keyspace-setting step. An empty string means no keyspace is set.
pub(crate) type SharedKeyspace = Arc<StdMutex<String>>;

/// One-shot establishment of a single ready connection:
///
/// TCP connect → OPTIONS/SUPPORTED → STARTUP → READY | authentication
/// exchange → optional `USE` of the current keyspace → ready.
///
/// Every `.await` inside is one transition of the setup state machine.
/// Cancellation is dropping the future: the half-open socket is closed by
/// the connection's drop.
pub(crate) struct Connector {
    address: SocketAddr,
    config: ConnectionConfig,
    queue_size_io: usize,
    keyspace: SharedKeyspace,
    flush_request_sender: mpsc::UnboundedSender<SocketAddr>,
    metrics: Arc<Metrics>,
}

impl Connector {
    pub(crate) fn new(
        address: SocketAddr,
        config: ConnectionConfig,
        queue_size_io: usize,
        keyspace: SharedKeyspace,
        flush_request_sender: mpsc::UnboundedSender<SocketAddr>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            address,
            config,
            queue_size_io,
            keyspace,
            flush_request_sender,
            metrics,
        }
    }

    pub(crate) async fn connect(self) -> Result<(PooledConnection, ErrorReceiver), ConnectionError> {
        let start = Instant::now();
        let result = self.do_connect().await;

        match &result {
            Ok(_) => {
                self.metrics.inc_total_connections();
                let elapsed_us = start.elapsed().as_micros().min(u64::MAX as u128) as u64;
                let _ = self.metrics.log_connection_setup_latency(elapsed_us);
                debug!("[{}] Connection established", self.address);
            }
            Err(ConnectionError::ConnectTimeout) => {
                self.metrics.inc_connection_timeouts();
            }
            Err(err) => {
                debug!("[{}] Failed to establish connection: {}", self.address, err);
            }
        }

        result
    }

    async fn do_connect(&self) -> Result<(PooledConnection, ErrorReceiver), ConnectionError> {
        let (mut connection, error_receiver) = PooledConnection::new(
            self.address,
            &self.config,
            self.queue_size_io,
            self.flush_request_sender.clone(),
        )
        .await?;

        // The connect timeout bounds the whole setup, not just the TCP
        // dial: a node that accepts sockets but never answers the handshake
        // surfaces as a transient connect failure.
        match tokio::time::timeout(
            self.config.connect_timeout,
            self.perform_setup(&mut connection),
        )
        .await
        {
            Ok(setup_result) => setup_result?,
            Err(_) => return Err(ConnectionError::ConnectTimeout),
        }

        Ok((connection, error_receiver))
    }

    async fn perform_setup(&self, connection: &mut PooledConnection) -> Result<(), ConnectionError> {
        /* Ask which options the server supports. */
        let options_response = connection
            .send_setup_request(&request::Options, None)
            .await
            .map_err(|e| e.into_setup_error(CqlRequestKind::Options))?;

        let mut supported = match options_response {
            Response::Supported(supported) => supported,
            Response::Error(err) => {
                return Err(setup_error(
                    CqlRequestKind::Options,
                    ConnectionSetupRequestErrorKind::DbError(err.error, err.reason),
                ));
            }
            other => {
                return Err(setup_error(
                    CqlRequestKind::Options,
                    ConnectionSetupRequestErrorKind::UnexpectedResponse(other.to_response_kind()),
                ));
            }
        };

        let supported_compression = supported
            .options
            .remove(startup::COMPRESSION)
            .unwrap_or_default();

        /* Negotiate compression: fall back to none when the server does not
         * offer the requested algorithm. */
        let mut negotiated_compression = None;
        if let Some(compression) = self.config.compression {
            if supported_compression.iter().any(|c| c == compression.as_str()) {
                negotiated_compression = Some(compression);
            } else {
                warn!(
                    "Requested compression <{}> is not supported by the cluster. Falling back to no compression",
                    compression.as_str()
                );
            }
        }

        /* Commit to the chosen options with STARTUP. */
        let mut options = HashMap::new();
        options.insert(
            Cow::Borrowed(startup::CQL_VERSION),
            Cow::Borrowed(startup::DEFAULT_CQL_PROTOCOL_VERSION),
        );
        options.insert(
            Cow::Borrowed(startup::DRIVER_NAME),
            Cow::Borrowed(startup::DEFAULT_DRIVER_NAME),
        );
        if let Some(compression) = negotiated_compression {
            options.insert(
                Cow::Borrowed(startup::COMPRESSION),
                Cow::Borrowed(compression.as_str()),
            );
        }

        let startup_response = connection
            .send_setup_request(&request::Startup { options }, None)
            .await
            .map_err(|e| e.into_setup_error(CqlRequestKind::Startup))?;

        match startup_response {
            Response::Ready => {}
            Response::Authenticate(authenticate) => {
                self.perform_authenticate(connection, &authenticate, negotiated_compression)
                    .await?;
            }
            Response::Error(err) => {
                return Err(setup_error(
                    CqlRequestKind::Startup,
                    ConnectionSetupRequestErrorKind::DbError(err.error, err.reason),
                ));
            }
            other => {
                return Err(setup_error(
                    CqlRequestKind::Startup,
                    ConnectionSetupRequestErrorKind::UnexpectedResponse(other.to_response_kind()),
                ));
            }
        }

        // From here on both sides may compress frame bodies.
        connection.set_compression(negotiated_compression);

        /* Put the connection into the keyspace that is current right now.
         * Later keyspace changes do not migrate existing connections; that
         * is the request layer's business. */
        let keyspace = self.keyspace.lock().unwrap().clone();
        if !keyspace.is_empty() {
            Self::use_keyspace(connection, &keyspace, negotiated_compression).await?;
            connection.set_keyspace_name(Some(keyspace));
        }

        Ok(())
    }

    async fn perform_authenticate(
        &self,
        connection: &PooledConnection,
        authenticate: &Authenticate,
        compression: Option<Compression>,
    ) -> Result<(), ConnectionError> {
        let err = |kind: ConnectionSetupRequestErrorKind| {
            setup_error(CqlRequestKind::AuthResponse, kind)
        };

        let authenticator = match &self.config.authenticator {
            Some(authenticator) => authenticator,
            None => return Err(err(ConnectionSetupRequestErrorKind::MissingAuthentication)),
        };

        let mut exchange = authenticator
            .begin_exchange(&authenticate.authenticator_name)
            .await
            .map_err(|e| err(ConnectionSetupRequestErrorKind::AuthStartError(e)))?;
        let mut token = exchange
            .next_token(None)
            .await
            .map_err(|e| err(ConnectionSetupRequestErrorKind::AuthTokenError(e)))?;

        loop {
            let auth_response = connection
                .send_setup_request(&request::AuthResponse { response: token }, compression)
                .await
                .map_err(|e| e.into_setup_error(CqlRequestKind::AuthResponse))?;

            match auth_response {
                Response::AuthChallenge(challenge) => {
                    token = exchange
                        .next_token(challenge.authenticate_message.as_deref())
                        .await
                        .map_err(|e| err(ConnectionSetupRequestErrorKind::AuthTokenError(e)))?;
                }
                Response::AuthSuccess(success) => {
                    exchange
                        .finish(success.success_message.as_deref())
                        .await
                        .map_err(|e| err(ConnectionSetupRequestErrorKind::AuthFinishError(e)))?;
                    break;
                }
                Response::Error(db_err) => {
                    return Err(err(ConnectionSetupRequestErrorKind::DbError(
                        db_err.error,
                        db_err.reason,
                    )));
                }
                other => {
                    return Err(err(ConnectionSetupRequestErrorKind::UnexpectedResponse(
                        other.to_response_kind(),
                    )));
                }
            }
        }

        Ok(())
    }

    async fn use_keyspace(
        connection: &PooledConnection,
        keyspace: &str,
        compression: Option<Compression>,
    ) -> Result<(), ConnectionError> {
        let query = request::Query {
            contents: Cow::Owned(format!("USE {}", keyspace)),
            consistency: Default::default(),
        };

        let response = connection
            .send_setup_request(&query, compression)
            .await
            .map_err(|e| e.into_setup_error(CqlRequestKind::Query))?;

        match response {
            Response::Result(CqlResult::SetKeyspace(set_keyspace)) => {
                if !set_keyspace
                    .keyspace_name
                    .eq_ignore_ascii_case(keyspace)
                {
                    return Err(setup_error(
                        CqlRequestKind::Query,
                        ConnectionSetupRequestErrorKind::KeyspaceNameMismatch {
                            expected_keyspace_name_lowercase: keyspace.to_lowercase(),
                            result_keyspace_name_lowercase: set_keyspace
                                .keyspace_name
                                .to_lowercase(),
                        },
                    ));
                }
                Ok(())
            }
            Response::Error(err) => Err(setup_error(
                CqlRequestKind::Query,
                ConnectionSetupRequestErrorKind::DbError(err.error, err.reason),
            )),
            other => Err(setup_error(
                CqlRequestKind::Query,
                ConnectionSetupRequestErrorKind::UnexpectedResponse(other.to_response_kind()),
            )),
        }
    }
}

fn setup_error(
    request_kind: CqlRequestKind,
    kind: ConnectionSetupRequestErrorKind,
) -> ConnectionError {
    ConnectionSetupRequestError::new(request_kind, kind).into()
}
