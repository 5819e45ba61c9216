//! Persistent status-stream connection to one node.
//!
//! The link keeps a TCP connection to the node's status port open, feeds
//! every `status` snapshot into the registry and forwards queued
//! `start_feeding` / `stop_feeding` commands. On disconnect the node is
//! marked offline and the link reconnects with exponential backoff.
//!
//! **Panic-Free Policy:** no `.unwrap()`, `.expect()` or `panic!()`.

use std::sync::Arc;
use std::time::Duration;

use hydro_core::NodeAddress;
use hydro_protocol::{NodeCommand, NodeMessage, ProtocolError};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::NodeRegistry;
use crate::resolve::Resolver;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("link cancelled")]
    Cancelled,
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Node status stream port.
    pub status_port: u16,

    /// Initial delay before first retry after connection failure.
    pub retry_initial_delay: Duration,

    /// Maximum delay between retry attempts.
    pub retry_max_delay: Duration,

    /// Multiplier for exponential backoff.
    pub retry_multiplier: f64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            status_port: 8001,
            retry_initial_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            retry_multiplier: 2.0,
        }
    }
}

// ============================================================================
// Link
// ============================================================================

pub struct NodeLink {
    address: NodeAddress,
    config: LinkConfig,
    registry: Arc<NodeRegistry>,
    resolver: Arc<dyn Resolver>,
    cancel_token: CancellationToken,
}

impl NodeLink {
    #[must_use]
    pub fn new(
        address: NodeAddress,
        config: LinkConfig,
        registry: Arc<NodeRegistry>,
        resolver: Arc<dyn Resolver>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            address,
            config,
            registry,
            resolver,
            cancel_token,
        }
    }

    /// Maintains the connection until cancelled.
    pub async fn run(&self) {
        info!(node = %self.address, port = self.config.status_port, "Node link starting");

        loop {
            if self.cancel_token.is_cancelled() {
                break;
            }

            match self.connect_with_retry().await {
                Ok(stream) => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    if self.registry.attach_link(&self.address, tx).is_err() {
                        info!(node = %self.address, "Node no longer configured, link exiting");
                        return;
                    }
                    let _ = self.registry.mark_online(&self.address);

                    if let Err(e) = self.handle_connection(stream, rx).await {
                        warn!(node = %self.address, error = %e, "Node link ended with error");
                    }
                    let _ = self.registry.mark_offline(&self.address);
                }
                Err(LinkError::Cancelled) => break,
                Err(e) => {
                    warn!(node = %self.address, error = %e, "Node link connect failed");
                }
            }
        }

        info!(node = %self.address, "Node link stopped");
    }

    async fn connect_with_retry(&self) -> Result<TcpStream, LinkError> {
        let mut delay = self.config.retry_initial_delay;
        let mut attempt = 0u32;

        loop {
            attempt = attempt.saturating_add(1);

            match self.resolver.resolve(&self.address).await {
                Ok(host) => {
                    let target = host.socket_addr(self.config.status_port);
                    debug!(node = %self.address, %target, attempt, "Connecting to node");
                    match TcpStream::connect(target).await {
                        Ok(stream) => {
                            info!(node = %self.address, %target, "Node link connected");
                            return Ok(stream);
                        }
                        Err(e) => {
                            debug!(node = %self.address, attempt, error = %e, "Connect attempt failed");
                        }
                    }
                }
                Err(e) => {
                    if attempt == 1 {
                        warn!(node = %self.address, error = %e, "Cannot resolve node, will retry");
                    }
                }
            }

            tokio::select! {
                _ = sleep(delay) => {
                    let next_ms = (delay.as_millis() as f64 * self.config.retry_multiplier) as u64;
                    delay = Duration::from_millis(next_ms).min(self.config.retry_max_delay);
                }
                _ = self.cancel_token.cancelled() => return Err(LinkError::Cancelled),
            }
        }
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        mut commands: mpsc::UnboundedReceiver<NodeCommand>,
    ) -> Result<(), LinkError> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        loop {
            tokio::select! {
                // `next_line` is cancellation safe: a half-received line stays
                // buffered while a command is written.
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        info!(node = %self.address, "Node closed status stream");
                        return Ok(());
                    };
                    if let Err(e) = self.handle_line(&line) {
                        // A bad line does not end the connection.
                        warn!(node = %self.address, error = %e, "Ignoring malformed status line");
                    }
                }

                command = commands.recv() => {
                    let Some(command) = command else {
                        return Ok(());
                    };
                    writer.write_all(command.to_line()?.as_bytes()).await?;
                    writer.flush().await?;
                    debug!(node = %self.address, command = command.as_str(), "Command sent");
                }

                _ = self.cancel_token.cancelled() => return Ok(()),
            }
        }
    }

    fn handle_line(&self, line: &str) -> Result<(), LinkError> {
        if line.trim().is_empty() {
            return Ok(());
        }
        match NodeMessage::parse_line(line)? {
            NodeMessage::Status { status } => {
                if self
                    .registry
                    .apply_status(&self.address, status.to_patch())
                    .is_err()
                {
                    debug!(node = %self.address, "Status for unconfigured node dropped");
                }
            }
            NodeMessage::Ack { command } => {
                debug!(node = %self.address, command, "Node acknowledged command");
            }
            NodeMessage::Error { message } => {
                warn!(node = %self.address, error_message = %message, "Node reported error");
            }
        }
        Ok(())
    }
}

/// Spawns one link per address.
pub fn spawn_links(
    addresses: &[NodeAddress],
    config: &LinkConfig,
    registry: &Arc<NodeRegistry>,
    resolver: &Arc<dyn Resolver>,
    cancel_token: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    addresses
        .iter()
        .map(|address| {
            let link = NodeLink::new(
                address.clone(),
                config.clone(),
                Arc::clone(registry),
                Arc::clone(resolver),
                cancel_token.child_token(),
            );
            tokio::spawn(async move { link.run().await })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::SystemResolver;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn wait_for(mut check: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(tokio::time::Instant::now() < deadline, "condition not reached");
            sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_link_applies_status_and_forwards_commands() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let address = NodeAddress::new("127.0.0.1");
        let registry = Arc::new(NodeRegistry::with_nodes([address.clone()]));
        let cancel = CancellationToken::new();

        let link = NodeLink::new(
            address.clone(),
            LinkConfig {
                status_port: port,
                retry_initial_delay: Duration::from_millis(20),
                ..LinkConfig::default()
            },
            Arc::clone(&registry),
            Arc::new(SystemResolver::new("Garden")),
            cancel.clone(),
        );
        let handle = tokio::spawn(async move { link.run().await });

        let (mut socket, _) = listener.accept().await.unwrap();
        socket
            .write_all(
                b"garbage\n{\"type\":\"status\",\"water_level\":{\"sensor2\":{\"label\":\"Empty\",\"triggered\":true}}}\n",
            )
            .await
            .unwrap();

        wait_for(|| {
            registry
                .snapshot(&address)
                .and_then(|n| n.empty_sensor().map(|s| s.triggered))
                .unwrap_or(false)
        })
        .await;
        assert!(registry.is_online(&address));

        registry
            .send_command(&address, NodeCommand::StopFeeding)
            .unwrap();
        let mut buf = vec![0u8; 64];
        let n = socket.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"{\"type\":\"stop_feeding\"}\n");

        // Closing the stream marks the node offline; with the listener gone
        // the reconnect attempts keep failing.
        drop(listener);
        drop(socket);
        wait_for(|| !registry.is_online(&address)).await;
        assert!(registry.snapshot(&address).unwrap().last_seen.is_none());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_status_split_around_a_command_is_kept() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let address = NodeAddress::new("127.0.0.1");
        let registry = Arc::new(NodeRegistry::with_nodes([address.clone()]));
        let cancel = CancellationToken::new();

        let link = NodeLink::new(
            address.clone(),
            LinkConfig {
                status_port: port,
                ..LinkConfig::default()
            },
            Arc::clone(&registry),
            Arc::new(SystemResolver::new("Garden")),
            cancel.clone(),
        );
        let handle = tokio::spawn(async move { link.run().await });

        let (mut socket, _) = listener.accept().await.unwrap();
        wait_for(|| registry.is_online(&address)).await;

        socket
            .write_all(b"{\"type\":\"status\",\"water_level\":{\"sensor2\":")
            .await
            .unwrap();
        socket.flush().await.unwrap();
        sleep(Duration::from_millis(50)).await;

        // The command is written while the status line is half received.
        registry
            .send_command(&address, NodeCommand::StopFeeding)
            .unwrap();
        let mut buf = vec![0u8; 64];
        let n = socket.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"{\"type\":\"stop_feeding\"}\n");

        socket
            .write_all(b"{\"label\":\"Empty\",\"triggered\":true}}}\n")
            .await
            .unwrap();

        wait_for(|| {
            registry
                .snapshot(&address)
                .and_then(|n| n.empty_sensor().map(|s| s.triggered))
                == Some(true)
        })
        .await;

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_link_exits_on_cancel_while_retrying() {
        let registry = Arc::new(NodeRegistry::with_nodes(["127.0.0.1"]));
        let cancel = CancellationToken::new();
        let link = NodeLink::new(
            NodeAddress::new("127.0.0.1"),
            LinkConfig {
                // Nothing listens on port 9 locally.
                status_port: 9,
                retry_initial_delay: Duration::from_millis(10),
                ..LinkConfig::default()
            },
            registry,
            Arc::new(SystemResolver::new("Garden")),
            cancel.clone(),
        );
        let handle = tokio::spawn(async move { link.run().await });
        sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
