use crate::{
    config::ConnectorSettings,
    lapin_transport::LapinTransport,
    registry::ChannelRegistry,
    transport::{AmqpConnection, AmqpTransport},
};
use configs::{Configs, DynamicConfigs};
use messaging::{datasource::ConnectionState, errors::MessagingError};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

#[derive(Default)]
struct Session {
    state: ConnectionState,
    connection: Option<Arc<dyn AmqpConnection>>,
    registry: Option<Arc<ChannelRegistry>>,
}

/// The single broker connection of a data source.
///
/// There is no automatic reconnection: a lost connection is reported as
/// `Broken` and the caller decides when to open it again.
pub struct RabbitMQConnection {
    transport: Arc<dyn AmqpTransport>,
    settings: ConnectorSettings,
    session: RwLock<Session>,
}

impl RabbitMQConnection {
    pub fn new(transport: Arc<dyn AmqpTransport>, settings: ConnectorSettings) -> Self {
        RabbitMQConnection {
            transport,
            settings,
            session: RwLock::new(Session::default()),
        }
    }

    pub fn from_configs<T>(cfg: &Configs<T>) -> Result<Self, MessagingError>
    where
        T: DynamicConfigs,
    {
        Ok(RabbitMQConnection::new(
            LapinTransport::new(),
            ConnectorSettings::from_configs(&cfg.rabbitmq)?,
        ))
    }

    pub fn settings(&self) -> &ConnectorSettings {
        &self.settings
    }

    /// Opens the connection, a no-op when it is already open. On failure the
    /// state becomes `Broken`; nothing is retried.
    pub async fn open(&self) -> Result<ConnectionState, MessagingError> {
        let mut session = self.session.write().await;

        if let Some(conn) = &session.connection {
            if conn.is_connected() {
                return Ok(ConnectionState::Open);
            }
        }

        if let Some(registry) = session.registry.take() {
            registry.close().await;
        }
        session.connection = None;

        let params = &self.settings.params;
        if let Err(err) = params.validate() {
            error!(error = err.to_string(), "invalid connection params");
            session.state = ConnectionState::Broken;
            return Err(err);
        }

        match self.transport.connect(params).await {
            Ok(conn) => {
                session.registry = Some(Arc::new(ChannelRegistry::new(
                    conn.clone(),
                    self.settings.clone(),
                )));
                session.connection = Some(conn);
                session.state = ConnectionState::Open;

                debug!(uri = params.redacted_uri(), "connection opened");

                Ok(ConnectionState::Open)
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    uri = params.redacted_uri(),
                    "failure to open connection"
                );
                session.state = ConnectionState::Broken;

                Err(err)
            }
        }
    }

    /// Closes every channel, then the connection. Safe to call when closed.
    pub async fn close(&self) -> Result<ConnectionState, MessagingError> {
        let mut session = self.session.write().await;

        if let Some(registry) = session.registry.take() {
            registry.close().await;
        }

        let closed = match session.connection.take() {
            Some(conn) => conn.close().await,
            None => Ok(()),
        };
        session.state = ConnectionState::Closed;

        closed.map(|_| ConnectionState::Closed).map_err(|err| {
            warn!(error = err.to_string(), "failure to close connection");
            err
        })
    }

    pub async fn state(&self) -> ConnectionState {
        let session = self.session.read().await;

        match (&session.state, &session.connection) {
            (ConnectionState::Open, Some(conn)) if !conn.is_connected() => ConnectionState::Broken,
            (state, _) => *state,
        }
    }

    /// The channel registry of the current connection.
    pub async fn registry(&self) -> Result<Arc<ChannelRegistry>, MessagingError> {
        let session = self.session.read().await;

        match (&session.connection, &session.registry) {
            (Some(conn), Some(registry)) if conn.is_connected() => Ok(registry.clone()),
            (Some(_), Some(_)) => Err(MessagingError::ConnectionError(
                "connection was lost".to_owned(),
            )),
            _ => Err(MessagingError::ConnectionError(
                "connection is not open".to_owned(),
            )),
        }
    }
}
