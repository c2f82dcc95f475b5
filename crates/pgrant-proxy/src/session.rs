//! One client connection from startup packet to teardown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use pgrant_audit::{AuditEvent, AuditEventBuilder, AuditEventType, AuditLogger};
use pgrant_core::{Control, Grant};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use crate::cancel::CancelRegistry;
use crate::codec::{
    auth_cleartext_password, auth_ok, frontend, negotiate_protocol_version, parse_password,
    read_startup, ready_for_query, terminate, CodecError, ErrorFields, Frame, FrameCodec,
    StartupPacket, StartupRequest, MAX_AUTH_FRAME_LEN, MAX_FRAME_LEN,
};
use crate::collaborators::{
    Authenticator, BoxedStream, CredentialProvider, GrantResolver, QuotaStore, UpstreamConnector,
};
use crate::correlator::ResponseCorrelator;
use crate::error::ProxyError;
use crate::interceptor::RequestInterceptor;
use crate::quota::QuotaTracker;
use crate::upstream::{self, StartupOptions, UpstreamFramed};

type ClientFramed = Framed<BoxedStream, FrameCodec>;
type UpstreamSink = SplitSink<UpstreamFramed, Frame>;

/// Everything a session needs from outside.
#[derive(Clone)]
pub struct SessionServices {
    pub authenticator: Arc<dyn Authenticator>,
    pub grants: Arc<dyn GrantResolver>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub quota_store: Arc<dyn QuotaStore>,
    pub connector: Arc<dyn UpstreamConnector>,
    pub audit: Arc<AuditLogger>,
    pub cancels: Arc<CancelRegistry>,
    /// Client startup parameters passed on to the upstream server.
    pub forward_startup_parameters: Vec<String>,
}

/// Identity and shared state of an established session.
pub struct SessionContext {
    pub connection_id: String,
    pub user: String,
    pub database: String,
    pub grant: Grant,
    pub client_addr: Option<String>,
    pub audit: Arc<AuditLogger>,
    pub quota: Arc<QuotaTracker>,
}

impl SessionContext {
    /// Audit event builder with the session's identity filled in.
    pub fn event(&self, event_type: AuditEventType) -> AuditEventBuilder {
        let builder = AuditEvent::builder(event_type)
            .connection_id(&self.connection_id)
            .user(&self.user)
            .database(&self.database)
            .grant_id(&self.grant.id);
        match &self.client_addr {
            Some(addr) => builder.client_ip(addr),
            None => builder,
        }
    }

    /// Record an audit event. Failures are logged, never fatal.
    pub async fn audit(&self, event: AuditEvent) {
        if let Err(e) = self.audit.log(event).await {
            tracing::warn!(connection_id = %self.connection_id, error = %e, "Failed to log audit event");
        }
    }
}

/// Run a client connection to completion.
pub async fn serve_connection(
    services: &SessionServices,
    mut stream: BoxedStream,
    peer: Option<SocketAddr>,
) -> Result<(), ProxyError> {
    let client_addr = peer.map(|p| p.ip().to_string());

    let startup = loop {
        match read_startup(&mut stream).await? {
            None => return Ok(()),
            Some(StartupRequest::Ssl) | Some(StartupRequest::GssEnc) => {
                // No client-side encryption; the client continues in plaintext.
                stream.write_all(b"N").await?;
                stream.flush().await?;
            }
            Some(StartupRequest::Cancel(key)) => {
                match services.cancels.forward(services.connector.as_ref(), &key).await {
                    Ok(true) => {}
                    Ok(false) => tracing::debug!(peer = ?peer, "Cancel request for unknown key"),
                    Err(e) => tracing::warn!(peer = ?peer, error = %e, "Failed to forward cancel request"),
                }
                return Ok(());
            }
            Some(StartupRequest::Startup(packet)) => break packet,
        }
    };

    let mut client = Framed::new(stream, FrameCodec::with_max_frame_len(MAX_AUTH_FRAME_LEN));
    let Some(login) = login(services, &mut client, &startup, client_addr.as_deref()).await? else {
        return Ok(());
    };
    client.codec_mut().set_max_frame_len(MAX_FRAME_LEN);
    let Login { user, database, grant } = login;

    let started = Instant::now();
    let quota = Arc::new(QuotaTracker::start(&grant, services.quota_store.clone()).await);
    let ctx = Arc::new(SessionContext {
        connection_id: uuid::Uuid::new_v4().to_string(),
        user,
        database,
        grant,
        client_addr,
        audit: services.audit.clone(),
        quota,
    });

    // Opened once the grant is resolved. A failed upstream connection still
    // ends in connection.closed.
    tracing::info!(
        connection_id = %ctx.connection_id,
        user = %ctx.user,
        database = %ctx.database,
        grant_id = %ctx.grant.id,
        peer = ?peer,
        "Session opened"
    );
    ctx.audit(ctx.event(AuditEventType::ConnectionOpened).build()).await;

    let result = match connect_upstream(services, &startup, &ctx.database, &ctx.grant).await {
        Ok(upstream) => run_session(services, &ctx, client, upstream).await,
        Err(e) => {
            tracing::error!(
                connection_id = %ctx.connection_id,
                user = %ctx.user,
                database = %ctx.database,
                error = %e,
                "Upstream connection failed"
            );
            // The client learns nothing about the upstream or its credentials.
            let _ = client
                .send(ErrorFields::fatal("08001", "could not connect to the database server").to_frame())
                .await;
            Err(e)
        }
    };

    ctx.quota.finish().await;
    let duration_ms = started.elapsed().as_millis() as u64;
    let mut closed = ctx
        .event(AuditEventType::ConnectionClosed)
        .duration_ms(duration_ms)
        .query_count(ctx.quota.local_queries())
        .bytes(ctx.quota.local_bytes());
    if let Err(e) = &result {
        closed = closed.error(e.to_string());
    }
    ctx.audit(closed.build()).await;

    tracing::info!(
        connection_id = %ctx.connection_id,
        duration_ms,
        queries = ctx.quota.local_queries(),
        bytes = ctx.quota.local_bytes(),
        "Session closed"
    );
    result
}

/// Finish the client's login with the upstream's startup messages and
/// relay until either side goes away.
async fn run_session(
    services: &SessionServices,
    ctx: &Arc<SessionContext>,
    mut client: ClientFramed,
    upstream: upstream::UpstreamConnection,
) -> Result<(), ProxyError> {
    client.feed(auth_ok()).await?;
    for frame in upstream.startup_frames {
        client.feed(frame).await?;
    }
    client.send(ready_for_query(upstream.transaction_status)).await?;

    let _cancel_registration = upstream
        .cancel_key
        .map(|key| services.cancels.register(key, &upstream.host, upstream.port));

    relay(ctx.clone(), client, upstream.framed, upstream.transaction_status).await
}

struct Login {
    user: String,
    database: String,
    grant: Grant,
}

/// Protocol version check, password exchange and grant resolution. `None`
/// means the client was refused (and told so) or went away.
async fn login(
    services: &SessionServices,
    client: &mut ClientFramed,
    startup: &StartupPacket,
    client_addr: Option<&str>,
) -> Result<Option<Login>, ProxyError> {
    let (major, minor) = (startup.version >> 16, startup.version & 0xffff);
    if major != 3 {
        reject(
            client,
            ErrorFields::fatal(
                "0A000",
                format!("unsupported frontend protocol {major}.{minor}: server supports 3.0"),
            ),
        )
        .await?;
        return Ok(None);
    }
    let unrecognized: Vec<&str> = startup
        .params
        .iter()
        .map(|(k, _)| k.as_str())
        .filter(|k| k.starts_with("_pq_."))
        .collect();
    if minor > 0 || !unrecognized.is_empty() {
        client.feed(negotiate_protocol_version(0, &unrecognized)).await?;
    }

    let Some(user) = startup.get("user").map(str::to_string) else {
        reject(
            client,
            ErrorFields::fatal("08P01", "no PostgreSQL user name specified in startup packet"),
        )
        .await?;
        return Ok(None);
    };
    let database = startup.get("database").unwrap_or(user.as_str()).to_string();

    client.send(auth_cleartext_password()).await?;
    let password = match client.next().await {
        Some(Err(e @ (CodecError::TooLarge { .. } | CodecError::InvalidLength(_)))) => {
            let _ = reject(client, ErrorFields::fatal("08P01", "invalid password packet size")).await;
            return Err(e.into());
        }
        Some(frame) => {
            let frame = frame?;
            if frame.tag != frontend::PASSWORD {
                reject(client, ErrorFields::fatal("08P01", "expected password response")).await?;
                return Ok(None);
            }
            parse_password(&frame.body)?
        }
        None => return Ok(None),
    };

    let authenticated = match services.authenticator.authenticate(&user, &password).await {
        Ok(authenticated) => authenticated,
        Err(e) => {
            let _ = reject(client, ErrorFields::fatal("XX000", "internal error during authentication")).await;
            return Err(e);
        }
    };
    if !authenticated {
        tracing::warn!(user = %user, database = %database, peer = ?client_addr, "Authentication failed");
        audit_auth_failed(services, &user, &database, "invalid_credentials", client_addr).await;
        reject(
            client,
            ErrorFields::fatal("28P01", format!("password authentication failed for user \"{user}\"")),
        )
        .await?;
        return Ok(None);
    }

    match services.grants.resolve_grant(&user, &database).await {
        Ok(grant) => Ok(Some(Login { user, database, grant })),
        Err(reason) => {
            tracing::warn!(
                user = %user,
                database = %database,
                reason = reason.as_str(),
                "Access denied"
            );
            audit_auth_failed(services, &user, &database, reason.as_str(), client_addr).await;
            reject(client, ErrorFields::fatal("28000", reason.message())).await?;
            Ok(None)
        }
    }
}

async fn audit_auth_failed(
    services: &SessionServices,
    user: &str,
    database: &str,
    reason: &str,
    client_addr: Option<&str>,
) {
    if let Err(e) = services
        .audit
        .log_auth_failed(user, database, reason, client_addr)
        .await
    {
        tracing::warn!(error = %e, "Failed to log audit event");
    }
}

async fn reject(client: &mut ClientFramed, fields: ErrorFields) -> Result<(), ProxyError> {
    client.send(fields.to_frame()).await?;
    Ok(())
}

async fn connect_upstream(
    services: &SessionServices,
    startup: &StartupPacket,
    database: &str,
    grant: &Grant,
) -> Result<upstream::UpstreamConnection, ProxyError> {
    let credentials = services.credentials.upstream_credentials(database).await?;
    let options = StartupOptions {
        forwarded_params: startup
            .params
            .iter()
            .filter(|(key, _)| services.forward_startup_parameters.contains(key))
            .cloned()
            .collect(),
        read_only: grant.has_control(Control::ReadOnly),
    };
    Ok(upstream::connect(services.connector.as_ref(), &credentials, &options).await?)
}

/// Run both directions until either ends, then shut the other down.
///
/// Work the client already sent keeps running upstream after the client
/// leaves. It is accounted for until the upstream acknowledges the
/// `Terminate` by closing; whatever is still unanswered then is audited as
/// failed.
async fn relay(
    ctx: Arc<SessionContext>,
    client: ClientFramed,
    upstream: UpstreamFramed,
    transaction_status: u8,
) -> Result<(), ProxyError> {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();
    let (sender, receiver) = mpsc::unbounded_channel();
    let mut interceptor = RequestInterceptor::new(ctx.clone(), sender);
    let mut correlator = ResponseCorrelator::new(ctx.clone(), receiver, transaction_status);

    let (client_ended, result) = tokio::select! {
        r = relay_requests(&mut interceptor, &mut client_rx, &mut upstream_tx) => (true, r),
        r = correlator.run(&mut upstream_rx, &mut client_tx) => (false, r),
    };

    if client_ended {
        if let Err(ProxyError::Codec(CodecError::InvalidLength(_) | CodecError::TooLarge { .. })) =
            &result
        {
            let _ = client_tx
                .send(ErrorFields::fatal("08P01", "invalid frontend message length").to_frame())
                .await;
        }
        if !interceptor.terminated() {
            let _ = upstream_tx.send(terminate()).await;
        }
        if let Err(e) = correlator.drain(&mut upstream_rx).await {
            tracing::debug!(
                connection_id = %ctx.connection_id,
                error = %e,
                "Upstream failed while finishing outstanding work"
            );
        }
    }
    tracing::debug!(
        connection_id = %ctx.connection_id,
        client_ended,
        unanswered = correlator.pending(),
        "Relay finished"
    );
    correlator.abandon("connection closed").await;

    let _ = upstream_tx.close().await;
    let _ = client_tx.close().await;
    result
}

async fn relay_requests(
    interceptor: &mut RequestInterceptor,
    client: &mut SplitStream<ClientFramed>,
    upstream: &mut UpstreamSink,
) -> Result<(), ProxyError> {
    while let Some(frame) = client.next().await {
        if let Some(frame) = interceptor.intercept(frame?).await? {
            upstream.send(frame).await?;
        }
        if interceptor.terminated() {
            break;
        }
    }
    Ok(())
}
