//! TCP accept loop for switch connections.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{debug, error, info};

use super::handler;
use crate::controller::Controller;
use crate::error::Result;

/// Accepts switch connections on the configured OpenFlow port and spawns a
/// channel handler per connection.
pub struct ConnectionAcceptor {
    listener: TcpListener,
    controller: Arc<Controller>,
}

impl ConnectionAcceptor {
    pub async fn bind(controller: Arc<Controller>) -> Result<Self> {
        let settings = controller.settings();
        let addr: SocketAddr = format!(
            "{}:{}",
            settings.listen_address, settings.openflow_port
        )
        .parse()
        .map_err(|_| {
            config_error!(
                "invalid listen address {}:{}",
                settings.listen_address,
                settings.openflow_port
            )
        })?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| transport_error!("failed to bind OpenFlow port {}: {}", addr, e))?;
        info!(
            "Listening for switch connections on {}",
            listener.local_addr()?
        );
        Ok(ConnectionAcceptor {
            listener,
            controller,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn accept_loop(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                    }
                    debug!("New switch connection from {}", peer);
                    let controller = self.controller.clone();
                    tokio::spawn(async move {
                        handler::handle_connection(controller, stream, peer).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept switch connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}
