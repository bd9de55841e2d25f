use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::connection::Connection;
use super::Broker;
use crate::{config::BrokerConfig, Result};

pub struct BrokerServer {
    broker: Arc<Broker>,
    // Graceful shutdown coordination
    shutdown_tx: broadcast::Sender<()>,
    active_connections: Arc<AtomicUsize>,
}

impl BrokerServer {
    /// Builds the broker and recovers every virtual host before any
    /// connection can be accepted.
    pub async fn new(config: BrokerConfig) -> Result<Self> {
        let broker = Broker::new(config)?;
        broker.start().await?;

        let (shutdown_tx, _) = broadcast::channel(16);
        Ok(Self {
            broker,
            shutdown_tx,
            active_connections: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    /// Initiate graceful shutdown of the server
    pub fn shutdown(&self) {
        info!("Initiating graceful shutdown...");
        let _ = self.shutdown_tx.send(()); // Notify the listener and every connection
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(&self) -> Result<()> {
        let config = self.broker.config();
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!("FluxQ broker listening on {}", addr);

        if config.metrics_interval_secs > 0 {
            let metrics = Arc::clone(self.broker.metrics());
            let reporter =
                metrics.start_reporting(Duration::from_secs(config.metrics_interval_secs));
            let mut metrics_shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                let _ = metrics_shutdown_rx.recv().await;
                reporter.abort();
            });
        }

        self.serve(listener).await
    }

    /// Accept loop over an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let max_connections = self.broker.config().max_connections;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                // Handle new connections
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => self.accept(stream, peer_addr, max_connections),
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                // Handle shutdown signal
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal, stopping server gracefully...");
                    break;
                }
            }
        }

        self.broker.stop();
        info!("Server shutdown complete");
        Ok(())
    }

    fn accept(&self, stream: TcpStream, peer_addr: SocketAddr, max_connections: usize) {
        if max_connections > 0 && self.active_connections() >= max_connections {
            warn!(
                "Connection limit {} reached, dropping connection from {}",
                max_connections, peer_addr
            );
            return;
        }

        if let Err(e) = Self::optimize_client_socket(&stream) {
            warn!("Failed to optimize client socket {}: {}", peer_addr, e);
        }

        let active = self.active_connections.fetch_add(1, Ordering::SeqCst) + 1;
        info!("New client connected: {} (active: {})", peer_addr, active);

        let connection = Connection::new(
            stream,
            Arc::clone(&self.broker),
            peer_addr.to_string(),
            self.shutdown_tx.subscribe(),
        );
        let active_connections = Arc::clone(&self.active_connections);
        tokio::spawn(async move {
            if let Err(e) = connection.run().await {
                error!("Error handling client {}: {}", peer_addr, e);
            } else {
                debug!("Client {} disconnected", peer_addr);
            }
            active_connections.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Low-latency socket options for client connections
    fn optimize_client_socket(stream: &TcpStream) -> Result<()> {
        use socket2::SockRef;

        let socket_ref = SockRef::from(stream);

        // Frames are small and latency-sensitive
        socket_ref.set_nodelay(true)?;

        if let Err(e) = socket_ref.set_recv_buffer_size(256 * 1024) {
            warn!("Failed to set client recv buffer: {}", e);
        }
        if let Err(e) = socket_ref.set_send_buffer_size(256 * 1024) {
            warn!("Failed to set client send buffer: {}", e);
        }

        socket_ref.set_keepalive(true)?;

        Ok(())
    }
}
