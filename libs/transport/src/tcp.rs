//! Line-oriented TCP monitoring connection.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

use crate::connection::{Closed, Connector};
use crate::error::TransportError;

/// Connects to `addr` and forwards every received line to a channel.
///
/// A dropped receiver shuts the connection down.
pub struct TcpConnector {
    name: String,
    addr: SocketAddr,
    lines: mpsc::Sender<String>,
}

impl TcpConnector {
    pub fn new(name: impl Into<String>, addr: SocketAddr, lines: mpsc::Sender<String>) -> Self {
        Self {
            name: name.into(),
            addr,
            lines,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait(?Send)]
impl Connector for TcpConnector {
    type Connection = TcpStream;

    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&mut self) -> Result<TcpStream, TransportError> {
        TcpStream::connect(self.addr)
            .await
            .map_err(|e| TransportError::Connect {
                connection: self.name.clone(),
                reason: e.to_string(),
            })
    }

    async fn closed(&mut self, stream: TcpStream) -> Result<Closed, TransportError> {
        let mut lines = BufReader::new(stream).lines();

        while let Some(line) = lines.next_line().await? {
            debug!(connection = %self.name, bytes = line.len(), "received line");
            if self.lines.send(line).await.is_err() {
                return Ok(Closed::Shutdown);
            }
        }

        Ok(Closed::Lost("peer closed the connection".to_string()))
    }
}
