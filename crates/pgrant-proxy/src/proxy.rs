//! Listener: accepts client connections and runs a session for each.

use std::future::Future;
use std::sync::Arc;

use futures::SinkExt;
use pgrant_audit::AuditLogger;
use pgrant_core::{PgrantConfig, ProxyConfig};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::codec::Framed;

use crate::cancel::CancelRegistry;
use crate::codec::{read_startup, ErrorFields, FrameCodec, StartupRequest};
use crate::collaborators::TcpConnector;
use crate::error::ProxyError;
use crate::session::{serve_connection, SessionServices};
use crate::store::{ConfigAuthenticator, ConfigCredentialProvider, MemoryGrantStore};

/// The pgrant proxy server.
pub struct PgrantProxy {
    config: ProxyConfig,
    services: Arc<SessionServices>,
}

impl PgrantProxy {
    pub fn new(config: ProxyConfig, services: SessionServices) -> Self {
        Self {
            config,
            services: Arc::new(services),
        }
    }

    /// Proxy backed entirely by the configuration file: users, grants and
    /// upstream credentials all come from `config`.
    pub fn from_config(config: &PgrantConfig, audit: AuditLogger) -> Self {
        let grants = Arc::new(MemoryGrantStore::from_config(config));
        let services = SessionServices {
            authenticator: Arc::new(ConfigAuthenticator::from_config(config)),
            grants: grants.clone(),
            credentials: Arc::new(ConfigCredentialProvider::from_config(config)),
            quota_store: grants,
            connector: Arc::new(TcpConnector),
            audit: Arc::new(audit),
            cancels: Arc::new(CancelRegistry::new()),
            forward_startup_parameters: config.proxy.forward_startup_parameters.clone(),
        };
        Self::new(config.proxy.clone(), services)
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Run until the process is stopped.
    pub async fn run(&self) -> Result<(), ProxyError> {
        self.run_until(std::future::pending()).await
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> Result<(), ProxyError> {
        let listen_addr = self.config.listen_address();
        let listener = TcpListener::bind(&listen_addr)
            .await
            .map_err(|e| ProxyError::BindFailed {
                address: listen_addr.clone(),
                source: e,
            })?;
        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), ProxyError> {
        tracing::info!(
            address = %listener.local_addr().map_err(ProxyError::Io)?,
            max_connections = self.config.max_connections,
            "Proxy server listening"
        );

        let slots = Arc::new(Semaphore::new(self.config.max_connections as usize));
        tokio::pin!(shutdown);

        loop {
            let (socket, peer_addr) = tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutting down listener");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!(error = %ProxyError::AcceptFailed(e), "Failed to accept connection");
                        continue;
                    }
                },
            };

            if let Err(e) = socket.set_nodelay(true) {
                tracing::debug!(peer = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
            }
            tracing::debug!(peer = %peer_addr, "New connection");

            let Ok(permit) = slots.clone().try_acquire_owned() else {
                tracing::warn!(peer = %peer_addr, "Connection limit reached");
                tokio::spawn(refuse_connection(socket));
                continue;
            };

            let services = self.services.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = serve_connection(&services, Box::new(socket), Some(peer_addr)).await {
                    tracing::error!(peer = %peer_addr, error = %e, "Connection error");
                }
            });
        }
    }
}

/// Tell a client over the limit why it is turned away, as the server does.
async fn refuse_connection(mut socket: TcpStream) {
    // Only a startup packet can be answered with an ErrorResponse.
    if let Ok(Some(StartupRequest::Startup(_))) = read_startup(&mut socket).await {
        let mut framed = Framed::new(socket, FrameCodec::new());
        let _ = framed
            .send(ErrorFields::fatal("53300", "sorry, too many clients already").to_frame())
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{backend, StartupPacket};
    use futures::StreamExt;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_over_limit_client_is_refused() {
        let config = PgrantConfig {
            proxy: ProxyConfig {
                max_connections: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let proxy = PgrantProxy::from_config(&config, AuditLogger::disabled());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            proxy
                .serve(listener, async {
                    let _ = stopped.await;
                })
                .await
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let startup = StartupPacket::new(vec![("user".to_string(), "alice".to_string())]);
        client.write_all(&startup.to_bytes()).await.unwrap();
        let mut framed = Framed::new(client, FrameCodec::new());
        let frame = framed.next().await.unwrap().unwrap();
        assert_eq!(frame.tag, backend::ERROR_RESPONSE);
        assert_eq!(ErrorFields::parse(&frame.body).unwrap().code, "53300");

        stop.send(()).unwrap();
        server.await.unwrap().unwrap();
    }
}
