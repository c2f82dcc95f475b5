//! Connection and login to the upstream PostgreSQL server.
//!
//! Each client session owns one upstream connection, opened with the
//! credentials of the grant's database rather than anything the client sent.

use bytes::BufMut;
use futures::{SinkExt, StreamExt};
use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;

use crate::auth::{md5_password, ScramClient, ScramError, SCRAM_SHA_256};
use crate::codec::{
    auth, backend, parse_authentication, parse_sasl_mechanisms, password_message,
    sasl_initial_response, sasl_response, CancelKey, CodecError, ErrorFields, Frame, FrameCodec,
    StartupPacket, SSL_REQUEST_CODE,
};
use crate::collaborators::{BoxedStream, UpstreamConnector, UpstreamCredentials};
use crate::tls;

/// Framed upstream connection.
pub type UpstreamFramed = Framed<BoxedStream, FrameCodec>;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("server does not support TLS but ssl_mode requires it")]
    TlsRequired,

    #[error("invalid server name for TLS: {0}")]
    InvalidServerName(String),

    #[error("unexpected response to SSLRequest: {0:#04x}")]
    UnexpectedSslResponse(u8),

    #[error("server requested a password but none is configured")]
    PasswordRequired,

    #[error("unsupported authentication method {0}")]
    UnsupportedAuthentication(String),

    #[error("SCRAM authentication failed: {0}")]
    Scram(#[from] ScramError),

    #[error("server rejected login: {} {}", .0.code, .0.message)]
    Rejected(ErrorFields),

    #[error("unexpected message '{0}' during startup")]
    UnexpectedMessage(char),

    #[error("server closed the connection during startup")]
    Closed,
}

/// An upstream connection that finished its startup and is ready for
/// queries.
pub struct UpstreamConnection {
    pub framed: UpstreamFramed,
    /// `ParameterStatus`, `BackendKeyData` and `NoticeResponse` messages, to
    /// be relayed to the client in order.
    pub startup_frames: Vec<Frame>,
    pub cancel_key: Option<CancelKey>,
    /// Transaction status from the first `ReadyForQuery`.
    pub transaction_status: u8,
    pub host: String,
    pub port: u16,
}

impl UpstreamConnection {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Debug for UpstreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConnection")
            .field("address", &self.address())
            .field("cancel_key", &self.cancel_key)
            .field("startup_frames", &self.startup_frames.len())
            .finish()
    }
}

/// What the session asks of the upstream login.
#[derive(Debug, Clone, Default)]
pub struct StartupOptions {
    /// Client startup parameters passed through (`application_name`, ...).
    pub forwarded_params: Vec<(String, String)>,
    /// Start every transaction read-only.
    pub read_only: bool,
}

/// Connect, negotiate TLS per `ssl_mode`, and log in.
pub async fn connect(
    connector: &dyn UpstreamConnector,
    credentials: &UpstreamCredentials,
    options: &StartupOptions,
) -> Result<UpstreamConnection, UpstreamError> {
    let address = format!("{}:{}", credentials.host, credentials.port);
    let stream = connector
        .connect(&credentials.host, credentials.port)
        .await
        .map_err(|source| UpstreamError::Connect {
            address: address.clone(),
            source,
        })?;

    let stream = negotiate_tls(stream, credentials).await?;
    let mut framed = Framed::new(stream, FrameCodec::new());

    let startup = startup_packet(credentials, options);
    framed.get_mut().write_all(&startup.to_bytes()).await?;
    framed.get_mut().flush().await?;

    authenticate(&mut framed, credentials).await?;

    let mut startup_frames = Vec::new();
    let mut cancel_key = None;
    let transaction_status = loop {
        let frame = next_frame(&mut framed).await?;
        match frame.tag {
            backend::READY_FOR_QUERY => break frame.body.first().copied().unwrap_or(b'I'),
            backend::BACKEND_KEY_DATA => {
                cancel_key = Some(CancelKey::from_backend_key_data(&frame.body)?);
                startup_frames.push(frame);
            }
            backend::PARAMETER_STATUS | backend::NOTICE_RESPONSE => startup_frames.push(frame),
            backend::ERROR_RESPONSE => {
                return Err(UpstreamError::Rejected(ErrorFields::parse(&frame.body)?));
            }
            other => return Err(UpstreamError::UnexpectedMessage(char::from(other))),
        }
    };

    tracing::debug!(
        address = %address,
        tls = credentials.ssl_mode.attempts_tls(),
        "Upstream ready"
    );

    Ok(UpstreamConnection {
        framed,
        startup_frames,
        cancel_key,
        transaction_status,
        host: credentials.host.clone(),
        port: credentials.port,
    })
}

fn startup_packet(credentials: &UpstreamCredentials, options: &StartupOptions) -> StartupPacket {
    let mut params = vec![
        ("user".to_string(), credentials.username.clone()),
        ("database".to_string(), credentials.database.clone()),
    ];
    params.extend(
        options
            .forwarded_params
            .iter()
            .filter(|(key, _)| {
                !matches!(key.as_str(), "user" | "database" | "default_transaction_read_only")
            })
            .cloned(),
    );
    if options.read_only {
        params.push(("default_transaction_read_only".to_string(), "on".to_string()));
    }
    StartupPacket::new(params)
}

async fn negotiate_tls(
    mut stream: BoxedStream,
    credentials: &UpstreamCredentials,
) -> Result<BoxedStream, UpstreamError> {
    let Some(config) = tls::client_config(credentials.ssl_mode)? else {
        return Ok(stream);
    };

    let mut request = bytes::BytesMut::with_capacity(8);
    request.put_i32(8);
    request.put_i32(SSL_REQUEST_CODE);
    stream.write_all(&request).await?;
    stream.flush().await?;

    match stream.read_u8().await? {
        b'S' => {
            let server_name = ServerName::try_from(credentials.host.clone())
                .map_err(|_| UpstreamError::InvalidServerName(credentials.host.clone()))?;
            let tls_stream = TlsConnector::from(config)
                .connect(server_name, stream)
                .await?;
            Ok(Box::new(tls_stream))
        }
        b'N' if credentials.ssl_mode.requires_tls() => Err(UpstreamError::TlsRequired),
        b'N' => {
            tracing::debug!(host = %credentials.host, "Upstream declined TLS, continuing in plaintext");
            Ok(stream)
        }
        other => Err(UpstreamError::UnexpectedSslResponse(other)),
    }
}

async fn authenticate(
    framed: &mut UpstreamFramed,
    credentials: &UpstreamCredentials,
) -> Result<(), UpstreamError> {
    let mut scram: Option<ScramClient> = None;

    loop {
        let frame = next_frame(framed).await?;
        match frame.tag {
            backend::AUTHENTICATION => {}
            backend::ERROR_RESPONSE => {
                return Err(UpstreamError::Rejected(ErrorFields::parse(&frame.body)?));
            }
            backend::NOTICE_RESPONSE => continue,
            other => return Err(UpstreamError::UnexpectedMessage(char::from(other))),
        }

        let (code, data) = parse_authentication(&frame.body)?;
        let password = || {
            credentials
                .password
                .as_deref()
                .ok_or(UpstreamError::PasswordRequired)
        };

        let reply = match code {
            auth::OK => return Ok(()),
            auth::CLEARTEXT_PASSWORD => password_message(password()?),
            auth::MD5_PASSWORD => {
                let salt = data.get(..4).ok_or(CodecError::Malformed {
                    message: "AuthenticationMD5Password",
                    reason: "truncated",
                })?;
                password_message(&md5_password(&credentials.username, password()?, salt))
            }
            auth::SASL => {
                let mechanisms = parse_sasl_mechanisms(data)?;
                if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                    return Err(UpstreamError::UnsupportedAuthentication(mechanisms.join(", ")));
                }
                let client = ScramClient::new(password()?);
                let reply = sasl_initial_response(SCRAM_SHA_256, client.client_first().as_bytes());
                scram = Some(client);
                reply
            }
            auth::SASL_CONTINUE => {
                let client = scram.as_mut().ok_or(UpstreamError::UnexpectedMessage('R'))?;
                let server_first =
                    std::str::from_utf8(data).map_err(|_| ScramError::MalformedServerFirst)?;
                sasl_response(client.client_final(server_first)?.as_bytes())
            }
            auth::SASL_FINAL => {
                let client = scram.as_ref().ok_or(UpstreamError::UnexpectedMessage('R'))?;
                let server_final =
                    std::str::from_utf8(data).map_err(|_| ScramError::MalformedServerFinal)?;
                client.verify_server_final(server_final)?;
                continue;
            }
            other => return Err(UpstreamError::UnsupportedAuthentication(format!("code {other}"))),
        };
        framed.send(reply).await?;
    }
}

async fn next_frame(framed: &mut UpstreamFramed) -> Result<Frame, UpstreamError> {
    match framed.next().await {
        Some(frame) => Ok(frame?),
        None => Err(UpstreamError::Closed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{auth_ok, read_startup, ready_for_query, StartupRequest};
    use async_trait::async_trait;
    use bytes::{Bytes, BytesMut};
    use pgrant_core::SslMode;
    use std::sync::Mutex;
    use tokio::io::DuplexStream;

    /// Hands out one pre-made stream.
    struct OneShot(Mutex<Option<DuplexStream>>);

    #[async_trait]
    impl UpstreamConnector for OneShot {
        async fn connect(&self, _host: &str, _port: u16) -> std::io::Result<BoxedStream> {
            let stream = self.0.lock().unwrap().take().expect("connected twice");
            Ok(Box::new(stream))
        }
    }

    fn credentials(password: Option<&str>) -> UpstreamCredentials {
        UpstreamCredentials {
            host: "db.internal".to_string(),
            port: 5432,
            database: "sales_prod".to_string(),
            username: "svc".to_string(),
            password: password.map(str::to_string),
            ssl_mode: SslMode::Disable,
        }
    }

    fn md5_request() -> Frame {
        let mut body = BytesMut::new();
        body.put_i32(auth::MD5_PASSWORD);
        body.extend_from_slice(&[1, 2, 3, 4]);
        Frame::new(backend::AUTHENTICATION, body.freeze())
    }

    #[tokio::test]
    async fn test_md5_login_and_startup_frames() {
        let (proxy_side, server_side) = tokio::io::duplex(8192);
        let connector = OneShot(Mutex::new(Some(proxy_side)));

        let server = tokio::spawn(async move {
            let mut server_side = server_side;
            let Some(StartupRequest::Startup(startup)) =
                read_startup(&mut server_side).await.unwrap()
            else {
                panic!("expected startup packet");
            };
            let mut framed = Framed::new(server_side, FrameCodec::new());
            framed.send(md5_request()).await.unwrap();
            let reply = framed.next().await.unwrap().unwrap();
            let expected = md5_password("svc", "pw", &[1, 2, 3, 4]);
            assert_eq!(crate::codec::parse_password(&reply.body).unwrap(), expected);

            framed.send(auth_ok()).await.unwrap();
            let mut status = BytesMut::new();
            status.extend_from_slice(b"server_version\x0016.2\x00");
            framed
                .send(Frame::new(backend::PARAMETER_STATUS, status.freeze()))
                .await
                .unwrap();
            framed
                .send(Frame::new(
                    backend::BACKEND_KEY_DATA,
                    Bytes::from_static(&[0, 0, 0, 9, 0, 0, 0, 1]),
                ))
                .await
                .unwrap();
            framed.send(ready_for_query(b'I')).await.unwrap();
            startup
        });

        let options = StartupOptions {
            forwarded_params: vec![
                ("application_name".to_string(), "psql".to_string()),
                ("user".to_string(), "alice".to_string()),
            ],
            read_only: true,
        };
        let conn = connect(&connector, &credentials(Some("pw")), &options)
            .await
            .unwrap();
        let startup = server.await.unwrap();

        assert_eq!(startup.get("user"), Some("svc"));
        assert_eq!(startup.get("database"), Some("sales_prod"));
        assert_eq!(startup.get("application_name"), Some("psql"));
        assert_eq!(startup.get("default_transaction_read_only"), Some("on"));

        assert_eq!(conn.startup_frames.len(), 2);
        assert_eq!(conn.cancel_key.as_ref().unwrap().process_id, 9);
        assert_eq!(conn.transaction_status, b'I');
        assert_eq!(conn.address(), "db.internal:5432");
    }

    #[tokio::test]
    async fn test_login_rejected() {
        let (proxy_side, server_side) = tokio::io::duplex(8192);
        let connector = OneShot(Mutex::new(Some(proxy_side)));

        tokio::spawn(async move {
            let mut server_side = server_side;
            read_startup(&mut server_side).await.unwrap();
            let mut framed = Framed::new(server_side, FrameCodec::new());
            framed
                .send(ErrorFields::fatal("28P01", "password authentication failed").to_frame())
                .await
                .unwrap();
        });

        let err = connect(&connector, &credentials(Some("pw")), &StartupOptions::default())
            .await
            .unwrap_err();
        match err {
            UpstreamError::Rejected(fields) => assert_eq!(fields.code, "28P01"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_password_required() {
        let (proxy_side, server_side) = tokio::io::duplex(8192);
        let connector = OneShot(Mutex::new(Some(proxy_side)));

        tokio::spawn(async move {
            let mut server_side = server_side;
            read_startup(&mut server_side).await.unwrap();
            let mut framed = Framed::new(server_side, FrameCodec::new());
            framed.send(md5_request()).await.unwrap();
            // Hold the connection open until the client gives up.
            let _ = framed.next().await;
        });

        let err = connect(&connector, &credentials(None), &StartupOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::PasswordRequired));
    }

    #[tokio::test]
    async fn test_require_tls_refused() {
        let (proxy_side, mut server_side) = tokio::io::duplex(8192);
        let connector = OneShot(Mutex::new(Some(proxy_side)));

        tokio::spawn(async move {
            let mut request = [0u8; 8];
            server_side.read_exact(&mut request).await.unwrap();
            server_side.write_all(b"N").await.unwrap();
            let _ = server_side.read_u8().await;
        });

        let mut creds = credentials(Some("pw"));
        creds.ssl_mode = SslMode::Require;
        let err = connect(&connector, &creds, &StartupOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::TlsRequired));
    }
}
