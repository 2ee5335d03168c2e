//! Connection driver.

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::backoff::ReconnectBackoff;
use crate::error::TransportError;

/// Why an established connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Closed {
    /// The peer went away; reconnect.
    Lost(String),

    /// The consumer is gone; stop for good.
    Shutdown,
}

/// Something that can (re)establish a monitoring connection.
///
/// Futures are not required to be `Send`; connectors run on a `LocalSet`.
#[async_trait(?Send)]
pub trait Connector {
    type Connection;

    /// Connection name used in logs and errors.
    fn name(&self) -> &str;

    async fn connect(&mut self) -> Result<Self::Connection, TransportError>;

    /// Serve an established connection until it closes.
    async fn closed(&mut self, connection: Self::Connection) -> Result<Closed, TransportError>;
}

/// Keep `connector` connected until it shuts down or exhausts `backoff`.
pub async fn run_connection<C: Connector + ?Sized>(
    connector: &mut C,
    backoff: &mut ReconnectBackoff,
) -> Result<(), TransportError> {
    loop {
        let reason = match connector.connect().await {
            Ok(connection) => {
                backoff.on_connected();
                info!(connection = connector.name(), "connected");

                match connector.closed(connection).await {
                    Ok(Closed::Shutdown) => {
                        info!(connection = connector.name(), "connection shut down");
                        return Ok(());
                    }
                    Ok(Closed::Lost(reason)) => reason,
                    Err(err) => err.to_string(),
                }
            }
            Err(err) => err.to_string(),
        };

        let delay = backoff.on_disconnect(connector.name())?;
        if backoff.failures() > 1 {
            debug!(connection = connector.name(), reason = %reason, "connection lost");
        }
        sleep(delay).await;
    }
}

/// Spawn a connection onto the current `LocalSet` with the default backoff.
pub fn spawn_connection<C>(mut connector: C) -> JoinHandle<Result<(), TransportError>>
where
    C: Connector + 'static,
{
    tokio::task::spawn_local(async move {
        let mut backoff = ReconnectBackoff::default();
        run_connection(&mut connector, &mut backoff).await
    })
}
