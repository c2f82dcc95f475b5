//! Upstream to client direction.
//!
//! The request direction pushes an [`Expectation`] for every message that
//! will produce a response, before forwarding it. The correlator pops them as
//! responses arrive, which is how it knows which SQL a `CommandComplete`
//! belongs to and where in the stream a denial synthesized by the proxy has
//! to be delivered.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use pgrant_audit::AuditEventType;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use crate::codec::{
    backend, parse_command_complete, ready_for_query, rows_from_command_tag, ErrorFields, Frame,
    FrameCodec,
};
use crate::collaborators::BoxedStream;
use crate::error::ProxyError;
use crate::session::SessionContext;

pub type ClientSink = SplitSink<Framed<BoxedStream, FrameCodec>, Frame>;
pub type UpstreamSource = SplitStream<Framed<BoxedStream, FrameCodec>>;

/// Which sub-protocol an execution came through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Simple,
    Extended,
    FunctionCall,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Simple => "simple",
            Protocol::Extended => "extended",
            Protocol::FunctionCall => "function_call",
        }
    }
}

/// A forwarded `Query` or `Execute` waiting for its completion.
#[derive(Debug)]
pub struct PendingExecution {
    pub sql: String,
    pub protocol: Protocol,
    pub started: Instant,
    bytes: u64,
    rows: Option<u64>,
    command_tag: Option<String>,
    error: Option<String>,
}

impl PendingExecution {
    pub fn new(sql: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            sql: sql.into(),
            protocol,
            started: Instant::now(),
            bytes: 0,
            rows: None,
            command_tag: None,
            error: None,
        }
    }

    fn complete(&mut self, tag: String) {
        if let Some(rows) = rows_from_command_tag(&tag) {
            self.rows = Some(self.rows.unwrap_or(0) + rows);
        }
        self.command_tag = Some(tag);
    }
}

/// A response the correlator is waiting for, in request order.
#[derive(Debug)]
pub enum Expectation {
    Parse,
    Bind,
    Describe,
    Close,
    Execute(PendingExecution),
    /// Ends with `ReadyForQuery`.
    Sync,
    /// Simple query; ends with `ReadyForQuery`.
    Query(PendingExecution),
    /// Frames made up by the proxy, released when they reach the head.
    Synthesized {
        frames: Vec<Frame>,
        /// Follow the frames with `ReadyForQuery`.
        ready_for_query: bool,
    },
}

/// Relays upstream responses and matches them to requests.
pub struct ResponseCorrelator {
    ctx: Arc<SessionContext>,
    receiver: mpsc::UnboundedReceiver<Expectation>,
    queue: VecDeque<Expectation>,
    /// Upstream errored in extended mode and discards messages until Sync.
    skipping: bool,
    transaction_status: u8,
}

impl ResponseCorrelator {
    pub fn new(
        ctx: Arc<SessionContext>,
        receiver: mpsc::UnboundedReceiver<Expectation>,
        transaction_status: u8,
    ) -> Self {
        Self {
            ctx,
            receiver,
            queue: VecDeque::new(),
            skipping: false,
            transaction_status,
        }
    }

    /// Number of responses still outstanding.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Relay until the upstream closes.
    pub async fn run(
        &mut self,
        upstream: &mut UpstreamSource,
        client: &mut ClientSink,
    ) -> Result<(), ProxyError> {
        let mut requests_open = true;
        loop {
            tokio::select! {
                biased;
                expectation = self.receiver.recv(), if requests_open => match expectation {
                    Some(expectation) => {
                        self.queue.push_back(expectation);
                        self.release_synthesized(client).await?;
                    }
                    None => requests_open = false,
                },
                frame = upstream.next() => match frame {
                    Some(frame) => self.on_frame(frame?, client).await?,
                    None => return Ok(()),
                },
            }
        }
    }

    fn drain_channel(&mut self) {
        while let Ok(expectation) = self.receiver.try_recv() {
            self.queue.push_back(expectation);
        }
    }

    /// After the client has gone: account for responses to work already
    /// forwarded, without relaying them. Ends once no execution is
    /// outstanding or the upstream closes.
    pub async fn drain(&mut self, upstream: &mut UpstreamSource) -> Result<(), ProxyError> {
        loop {
            self.drain_channel();
            self.queue.retain(|e| !matches!(e, Expectation::Synthesized { .. }));
            let outstanding = self
                .queue
                .iter()
                .any(|e| matches!(e, Expectation::Execute(_) | Expectation::Query(_)));
            if !outstanding {
                return Ok(());
            }
            match upstream.next().await {
                Some(frame) => self.observe(&frame?).await,
                None => return Ok(()),
            }
        }
    }

    /// Audit every execution still queued. Those that never completed are
    /// recorded as failed with `reason`.
    pub async fn abandon(&mut self, reason: &str) {
        self.drain_channel();
        while let Some(head) = self.queue.pop_front() {
            if let Expectation::Execute(mut pending) | Expectation::Query(mut pending) = head {
                if pending.error.is_none() && pending.command_tag.is_none() {
                    pending.error = Some(reason.to_string());
                }
                self.audit_execution(pending).await;
            }
        }
        self.ctx.quota.flush_bytes();
    }

    async fn on_frame(&mut self, frame: Frame, client: &mut ClientSink) -> Result<(), ProxyError> {
        self.observe(&frame).await;

        if matches!(frame.tag, backend::DATA_ROW | backend::COPY_DATA) {
            client.feed(frame).await?;
            return Ok(());
        }
        client.send(frame).await?;
        self.release_synthesized(client).await
    }

    /// Bookkeeping for one upstream message.
    async fn observe(&mut self, frame: &Frame) {
        self.drain_channel();

        match frame.tag {
            backend::DATA_ROW => {
                let n = frame.wire_len() as u64;
                self.ctx.quota.record_bytes(n);
                match self.queue.front_mut() {
                    Some(Expectation::Execute(pending) | Expectation::Query(pending)) => {
                        pending.bytes += n;
                    }
                    _ => tracing::trace!("DataRow without a pending execution"),
                }
            }
            backend::PARSE_COMPLETE => self.pop_if(|e| matches!(e, Expectation::Parse), frame.tag),
            backend::BIND_COMPLETE => self.pop_if(|e| matches!(e, Expectation::Bind), frame.tag),
            backend::CLOSE_COMPLETE => self.pop_if(|e| matches!(e, Expectation::Close), frame.tag),
            backend::NO_DATA | backend::ROW_DESCRIPTION => {
                // Also sent by simple queries, which complete later.
                if matches!(self.queue.front(), Some(Expectation::Describe)) {
                    self.queue.pop_front();
                }
            }
            backend::COMMAND_COMPLETE
            | backend::EMPTY_QUERY_RESPONSE
            | backend::PORTAL_SUSPENDED => {
                let tag = if frame.tag == backend::COMMAND_COMPLETE {
                    match parse_command_complete(&frame.body) {
                        Ok(tag) => Some(tag),
                        Err(e) => {
                            tracing::warn!(
                                connection_id = %self.ctx.connection_id,
                                error = %e,
                                "Unreadable command tag"
                            );
                            None
                        }
                    }
                } else {
                    None
                };
                self.on_completion(tag).await;
            }
            backend::ERROR_RESPONSE => self.on_error(frame).await,
            backend::READY_FOR_QUERY => self.on_ready_for_query(frame).await,
            _ => {}
        }
    }

    fn pop_if(&mut self, expected: impl Fn(&Expectation) -> bool, tag: u8) {
        match self.queue.front() {
            Some(head) if expected(head) => {
                self.queue.pop_front();
            }
            head => tracing::warn!(
                connection_id = %self.ctx.connection_id,
                tag = %char::from(tag),
                head = ?head,
                "Response does not match the pending request"
            ),
        }
    }

    async fn on_completion(&mut self, tag: Option<String>) {
        match self.queue.front_mut() {
            Some(Expectation::Query(pending)) => {
                if let Some(tag) = tag {
                    pending.complete(tag);
                }
            }
            Some(Expectation::Execute(_)) => {
                if let Some(Expectation::Execute(mut pending)) = self.queue.pop_front() {
                    if let Some(tag) = tag {
                        pending.complete(tag);
                    }
                    self.audit_execution(pending).await;
                }
            }
            _ => tracing::warn!(
                connection_id = %self.ctx.connection_id,
                "Command completion without a pending execution"
            ),
        }
    }

    async fn on_error(&mut self, frame: &Frame) {
        let message = match ErrorFields::parse(&frame.body) {
            Ok(fields) => format!("{}: {}", fields.code, fields.message),
            Err(_) => "unparsable error response".to_string(),
        };

        match self.queue.front_mut() {
            Some(Expectation::Query(pending)) => pending.error = Some(message),
            // An error on Sync itself, e.g. a failed implicit commit.
            Some(Expectation::Sync) | None => {}
            Some(_) => {
                if let Some(Expectation::Execute(mut pending)) = self.queue.pop_front() {
                    pending.error = Some(message);
                    self.audit_execution(pending).await;
                }
                self.skipping = true;
                self.skip_until_sync();
            }
        }
    }

    /// Drop what the upstream will not answer after an extended-protocol
    /// error.
    fn skip_until_sync(&mut self) {
        while let Some(head) = self.queue.front() {
            if matches!(head, Expectation::Sync) {
                break;
            }
            if let Some(Expectation::Execute(pending) | Expectation::Query(pending)) =
                self.queue.pop_front()
            {
                tracing::debug!(
                    connection_id = %self.ctx.connection_id,
                    sql = %pending.sql,
                    "Skipped after error"
                );
            }
        }
    }

    async fn on_ready_for_query(&mut self, frame: &Frame) {
        if self.skipping {
            self.skip_until_sync();
            self.skipping = false;
        }
        if let Some(&status) = frame.body.first() {
            self.transaction_status = status;
        }

        while let Some(head) = self.queue.pop_front() {
            match head {
                Expectation::Sync => break,
                Expectation::Query(pending) => {
                    self.audit_execution(pending).await;
                    break;
                }
                other => tracing::warn!(
                    connection_id = %self.ctx.connection_id,
                    expectation = ?other,
                    "Dropping unanswered request at ReadyForQuery"
                ),
            }
        }

        self.ctx.quota.flush_bytes();
    }

    /// Deliver proxy-made responses that have reached the head.
    async fn release_synthesized(&mut self, client: &mut ClientSink) -> Result<(), ProxyError> {
        loop {
            self.drain_channel();
            if self.skipping {
                self.skip_until_sync();
                return Ok(());
            }
            if !matches!(self.queue.front(), Some(Expectation::Synthesized { .. })) {
                return Ok(());
            }
            if let Some(Expectation::Synthesized {
                frames,
                ready_for_query: with_ready,
            }) = self.queue.pop_front()
            {
                for frame in frames {
                    client.feed(frame).await?;
                }
                if with_ready {
                    client.feed(ready_for_query(self.transaction_status)).await?;
                }
                client.flush().await?;
            }
        }
    }

    async fn audit_execution(&self, pending: PendingExecution) {
        let duration_ms = pending.started.elapsed().as_millis() as u64;
        let event_type = if pending.error.is_some() {
            AuditEventType::QueryFailed
        } else {
            AuditEventType::QueryExecuted
        };

        tracing::debug!(
            connection_id = %self.ctx.connection_id,
            protocol = pending.protocol.as_str(),
            duration_ms,
            bytes = pending.bytes,
            failed = pending.error.is_some(),
            "Query finished"
        );

        let mut builder = self
            .ctx
            .event(event_type)
            .sql(pending.sql)
            .protocol(pending.protocol.as_str())
            .duration_ms(duration_ms)
            .bytes(pending.bytes);
        if let Some(rows) = pending.rows {
            builder = builder.rows_affected(rows);
        }
        if let Some(tag) = pending.command_tag {
            builder = builder.command_tag(tag);
        }
        if let Some(error) = pending.error {
            builder = builder.error(error);
        }
        self.ctx.audit(builder.build()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::QuotaTracker;
    use crate::store::MemoryGrantStore;
    use bytes::{BufMut, BytesMut};
    use chrono::{Duration, Utc};
    use pgrant_audit::{AuditLogger, MemoryStorage};
    use pgrant_core::{AuditConfig, Grant};
    use tokio::io::DuplexStream;

    struct Fixture {
        correlator: ResponseCorrelator,
        sender: mpsc::UnboundedSender<Expectation>,
        client: ClientSink,
        events: Arc<MemoryStorage>,
        // Keeps the client end open so relayed frames have somewhere to go.
        _peer: DuplexStream,
    }

    async fn fixture() -> Fixture {
        let now = Utc::now();
        let grant = Grant::new("g1", "alice", "sales", now, now + Duration::hours(1));
        let store = Arc::new(MemoryGrantStore::new(vec![grant.clone()]));
        let events = Arc::new(MemoryStorage::new());
        let ctx = Arc::new(SessionContext {
            connection_id: "c1".to_string(),
            user: "alice".to_string(),
            database: "sales".to_string(),
            quota: Arc::new(QuotaTracker::start(&grant, store).await),
            grant,
            client_addr: None,
            audit: Arc::new(AuditLogger::with_storage(AuditConfig::default(), events.clone())),
        });

        let (ours, peer) = tokio::io::duplex(64 * 1024);
        let stream: BoxedStream = Box::new(ours);
        let (client, _) = Framed::new(stream, FrameCodec::new()).split();
        let (sender, receiver) = mpsc::unbounded_channel();
        Fixture {
            correlator: ResponseCorrelator::new(ctx, receiver, b'I'),
            sender,
            client,
            events,
            _peer: peer,
        }
    }

    fn frame(tag: u8) -> Frame {
        Frame::new(tag, bytes::Bytes::new())
    }

    fn complete(tag: &str) -> Frame {
        let mut body = BytesMut::new();
        body.extend_from_slice(tag.as_bytes());
        body.put_u8(0);
        Frame::new(backend::COMMAND_COMPLETE, body.freeze())
    }

    fn extended(sql: &str) -> [Expectation; 3] {
        [
            Expectation::Parse,
            Expectation::Bind,
            Expectation::Execute(PendingExecution::new(sql, Protocol::Extended)),
        ]
    }

    #[tokio::test]
    async fn test_queue_drains_after_acknowledged_sync() {
        let mut f = fixture().await;
        for e in extended("SELECT 1").into_iter().chain(extended("SELECT 2")) {
            f.sender.send(e).unwrap();
        }
        f.sender.send(Expectation::Sync).unwrap();

        let responses = [
            frame(backend::PARSE_COMPLETE),
            frame(backend::BIND_COMPLETE),
            complete("SELECT 1"),
            frame(backend::PARSE_COMPLETE),
            frame(backend::BIND_COMPLETE),
            complete("SELECT 1"),
        ];
        let mut remaining = Vec::new();
        for response in responses {
            f.correlator.on_frame(response, &mut f.client).await.unwrap();
            remaining.push(f.correlator.pending());
        }
        // Two Executes and the Sync are outstanding until answered.
        assert_eq!(remaining, vec![6, 5, 4, 3, 2, 1]);

        f.correlator
            .on_frame(ready_for_query(b'I'), &mut f.client)
            .await
            .unwrap();
        assert_eq!(f.correlator.pending(), 0);

        let sql: Vec<_> = f.events.events().into_iter().filter_map(|e| e.sql).collect();
        assert_eq!(sql, vec!["SELECT 1".to_string(), "SELECT 2".to_string()]);
    }

    #[tokio::test]
    async fn test_error_skips_rest_of_batch() {
        let mut f = fixture().await;
        for e in extended("SELECT broken") {
            f.sender.send(e).unwrap();
        }
        f.sender.send(Expectation::Sync).unwrap();

        f.correlator
            .on_frame(frame(backend::PARSE_COMPLETE), &mut f.client)
            .await
            .unwrap();
        f.correlator
            .on_frame(ErrorFields::error("42P01", "no such table").to_frame(), &mut f.client)
            .await
            .unwrap();
        // Bind failed: the Execute will never be answered.
        assert_eq!(f.correlator.pending(), 1);

        f.correlator
            .on_frame(ready_for_query(b'I'), &mut f.client)
            .await
            .unwrap();
        assert_eq!(f.correlator.pending(), 0);
        assert!(f.events.events().is_empty());
    }

    #[tokio::test]
    async fn test_simple_query_failure_is_audited() {
        let mut f = fixture().await;
        f.sender
            .send(Expectation::Query(PendingExecution::new("SELECT x", Protocol::Simple)))
            .unwrap();

        f.correlator
            .on_frame(ErrorFields::error("42703", "column x does not exist").to_frame(), &mut f.client)
            .await
            .unwrap();
        assert_eq!(f.correlator.pending(), 1);
        f.correlator
            .on_frame(ready_for_query(b'I'), &mut f.client)
            .await
            .unwrap();
        assert_eq!(f.correlator.pending(), 0);

        let events = f.events.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, AuditEventType::QueryFailed);
        assert_eq!(events[0].error.as_deref(), Some("42703: column x does not exist"));
    }

    #[tokio::test]
    async fn test_synthesized_denial_waits_for_earlier_responses() {
        let mut f = fixture().await;
        f.sender
            .send(Expectation::Query(PendingExecution::new("SELECT 1", Protocol::Simple)))
            .unwrap();
        f.sender
            .send(Expectation::Synthesized {
                frames: vec![ErrorFields::error("42501", "denied").to_frame()],
                ready_for_query: true,
            })
            .unwrap();

        f.correlator.on_frame(complete("SELECT 1"), &mut f.client).await.unwrap();
        // The query has not finished yet, so the denial is still queued.
        assert_eq!(f.correlator.pending(), 2);

        f.correlator
            .on_frame(ready_for_query(b'T'), &mut f.client)
            .await
            .unwrap();
        assert_eq!(f.correlator.pending(), 0);
        assert_eq!(f.correlator.transaction_status, b'T');
    }

    #[tokio::test]
    async fn test_abandon_audits_unfinished_work() {
        let mut f = fixture().await;
        for e in extended("SELECT * FROM big") {
            f.sender.send(e).unwrap();
        }
        f.sender.send(Expectation::Sync).unwrap();
        f.sender
            .send(Expectation::Query(PendingExecution::new("SELECT 2", Protocol::Simple)))
            .unwrap();

        for response in [frame(backend::PARSE_COMPLETE), frame(backend::BIND_COMPLETE)] {
            f.correlator.on_frame(response, &mut f.client).await.unwrap();
        }
        let row = Frame::new(backend::DATA_ROW, vec![0, 1, 0, 0, 0, 1, b'x']);
        let row_len = row.wire_len() as u64;
        f.correlator.on_frame(row, &mut f.client).await.unwrap();

        f.correlator.abandon("connection closed").await;
        assert_eq!(f.correlator.pending(), 0);

        let events = f.events.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, AuditEventType::QueryFailed);
        assert_eq!(events[0].sql.as_deref(), Some("SELECT * FROM big"));
        assert_eq!(events[0].error.as_deref(), Some("connection closed"));
        assert_eq!(events[0].bytes, Some(row_len));
        assert_eq!(events[1].sql.as_deref(), Some("SELECT 2"));
        assert_eq!(events[1].event_type, AuditEventType::QueryFailed);
    }

    #[tokio::test]
    async fn test_completed_query_is_not_marked_failed_on_abandon() {
        let mut f = fixture().await;
        f.sender
            .send(Expectation::Query(PendingExecution::new("SELECT 1", Protocol::Simple)))
            .unwrap();
        f.correlator.on_frame(complete("SELECT 1"), &mut f.client).await.unwrap();

        // The upstream went away before ReadyForQuery.
        f.correlator.abandon("connection closed").await;
        let events = f.events.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, AuditEventType::QueryExecuted);
        assert_eq!(events[0].rows_affected, Some(1));
    }
}
