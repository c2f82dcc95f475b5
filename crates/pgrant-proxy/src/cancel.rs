//! Query cancellation.
//!
//! Clients receive the upstream server's own `BackendKeyData`, so a
//! `CancelRequest` arriving at the proxy carries a key the upstream knows.
//! The registry only has to remember which upstream each live key belongs
//! to.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::io::AsyncWriteExt;

use crate::codec::CancelKey;
use crate::collaborators::UpstreamConnector;

#[derive(Debug, Clone, PartialEq, Eq)]
struct CancelTarget {
    host: String,
    port: u16,
}

/// Process-wide map of cancel keys to upstream servers.
#[derive(Debug, Default)]
pub struct CancelRegistry {
    targets: Mutex<HashMap<CancelKey, CancelTarget>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember `key` until the returned guard is dropped.
    pub fn register(self: &Arc<Self>, key: CancelKey, host: &str, port: u16) -> CancelRegistration {
        if let Ok(mut targets) = self.targets.lock() {
            targets.insert(
                key.clone(),
                CancelTarget {
                    host: host.to_string(),
                    port,
                },
            );
        }
        CancelRegistration {
            registry: Arc::clone(self),
            key,
        }
    }

    pub fn len(&self) -> usize {
        self.targets.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn target(&self, key: &CancelKey) -> Option<CancelTarget> {
        self.targets.lock().ok()?.get(key).cloned()
    }

    /// Pass a cancel request to the upstream that issued `key`. Returns
    /// `false` for keys the proxy does not know.
    pub async fn forward(
        &self,
        connector: &dyn UpstreamConnector,
        key: &CancelKey,
    ) -> std::io::Result<bool> {
        let Some(target) = self.target(key) else {
            return Ok(false);
        };
        let mut stream = connector.connect(&target.host, target.port).await?;
        stream.write_all(&key.to_cancel_request()).await?;
        stream.shutdown().await?;
        tracing::debug!(
            host = %target.host,
            port = target.port,
            process_id = key.process_id,
            "Forwarded cancel request"
        );
        Ok(true)
    }
}

/// Removes its key from the registry on drop.
#[derive(Debug)]
pub struct CancelRegistration {
    registry: Arc<CancelRegistry>,
    key: CancelKey,
}

impl Drop for CancelRegistration {
    fn drop(&mut self) {
        if let Ok(mut targets) = self.registry.targets.lock() {
            targets.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{read_startup, StartupRequest};
    use crate::collaborators::BoxedStream;
    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::io::DuplexStream;

    struct Recorder(Mutex<Option<DuplexStream>>, Mutex<Vec<(String, u16)>>);

    #[async_trait]
    impl UpstreamConnector for Recorder {
        async fn connect(&self, host: &str, port: u16) -> std::io::Result<BoxedStream> {
            self.1.lock().unwrap().push((host.to_string(), port));
            Ok(Box::new(self.0.lock().unwrap().take().unwrap()))
        }
    }

    fn key(pid: i32) -> CancelKey {
        CancelKey {
            process_id: pid,
            secret_key: Bytes::from_static(&[0, 0, 0, 42]),
        }
    }

    #[tokio::test]
    async fn test_forward_to_registered_upstream() {
        let registry = Arc::new(CancelRegistry::new());
        let _registration = registry.register(key(7), "db.internal", 5432);

        let (proxy_side, mut server_side) = tokio::io::duplex(64);
        let connector = Recorder(Mutex::new(Some(proxy_side)), Mutex::new(Vec::new()));

        assert!(registry.forward(&connector, &key(7)).await.unwrap());
        assert_eq!(
            read_startup(&mut server_side).await.unwrap(),
            Some(StartupRequest::Cancel(key(7)))
        );
        assert_eq!(
            connector.1.lock().unwrap().as_slice(),
            &[("db.internal".to_string(), 5432)]
        );

        assert!(!registry.forward(&connector, &key(8)).await.unwrap());
    }

    #[test]
    fn test_registration_guard_removes_key() {
        let registry = Arc::new(CancelRegistry::new());
        let registration = registry.register(key(1), "h", 1);
        assert_eq!(registry.len(), 1);
        drop(registration);
        assert!(registry.is_empty());
    }
}
