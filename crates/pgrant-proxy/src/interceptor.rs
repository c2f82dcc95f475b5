//! Client to upstream direction.
//!
//! Every client message passes through [`RequestInterceptor::intercept`],
//! which decides whether it reaches the upstream server. Denied statements
//! are answered by the proxy itself through the correlator, so the client
//! sees an ordinary `ErrorResponse` at the right position in the stream.

use std::sync::Arc;

use chrono::Utc;
use pgrant_audit::AuditEventType;
use pgrant_policy::{PolicyEngine, PolicyViolation};
use tokio::sync::mpsc;

use crate::codec::{
    frontend, parse_bind, parse_execute, parse_parse, parse_query, parse_target, ErrorFields,
    Frame, TargetKind,
};
use crate::correlator::{Expectation, PendingExecution, Protocol};
use crate::error::ProxyError;
use crate::quota::QuotaExceeded;
use crate::session::SessionContext;
use crate::tracker::StatementTracker;

/// Why the proxy answered a message itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    Policy(PolicyViolation),
    Quota(QuotaExceeded),
}

impl Denial {
    pub fn to_error_fields(&self) -> ErrorFields {
        match self {
            Denial::Policy(violation) => ErrorFields::error(violation.sqlstate(), &violation.message),
            Denial::Quota(exceeded) => exceeded.to_error_fields(),
        }
    }
}

impl From<PolicyViolation> for Denial {
    fn from(violation: PolicyViolation) -> Self {
        Denial::Policy(violation)
    }
}

impl From<QuotaExceeded> for Denial {
    fn from(exceeded: QuotaExceeded) -> Self {
        Denial::Quota(exceeded)
    }
}

/// Request-side state of one session.
pub struct RequestInterceptor {
    ctx: Arc<SessionContext>,
    policy: PolicyEngine,
    tracker: StatementTracker,
    expectations: mpsc::UnboundedSender<Expectation>,
    /// A denial in extended mode: drop messages until the next Sync, as the
    /// server would after an error.
    ignore_till_sync: bool,
    terminated: bool,
}

impl RequestInterceptor {
    pub fn new(ctx: Arc<SessionContext>, expectations: mpsc::UnboundedSender<Expectation>) -> Self {
        let policy = PolicyEngine::for_grant(&ctx.grant);
        Self {
            ctx,
            policy,
            tracker: StatementTracker::new(),
            expectations,
            ignore_till_sync: false,
            terminated: false,
        }
    }

    /// Whether the client sent `Terminate`.
    pub fn terminated(&self) -> bool {
        self.terminated
    }

    /// Handle one client message. Returns the frame to forward upstream, or
    /// `None` when the proxy answers (or drops) it.
    pub async fn intercept(&mut self, frame: Frame) -> Result<Option<Frame>, ProxyError> {
        if frame.tag == frontend::TERMINATE {
            self.terminated = true;
            return Ok(Some(frame));
        }
        if frame.tag == frontend::SYNC {
            self.ignore_till_sync = false;
            self.expect(Expectation::Sync)?;
            return Ok(Some(frame));
        }
        if self.ignore_till_sync {
            tracing::debug!(
                connection_id = %self.ctx.connection_id,
                tag = %frame.tag_char(),
                "Discarding message until Sync"
            );
            return Ok(None);
        }

        match frame.tag {
            frontend::QUERY => self.on_query(frame).await,
            frontend::PARSE => self.on_parse(frame).await,
            frontend::BIND => {
                let bind = parse_bind(&frame.body)?;
                if !self.tracker.bind(&bind.portal, &bind.statement) {
                    tracing::warn!(
                        connection_id = %self.ctx.connection_id,
                        statement = %bind.statement,
                        "Bind to a statement the proxy has not seen, forwarding"
                    );
                }
                self.expect(Expectation::Bind)?;
                Ok(Some(frame))
            }
            frontend::DESCRIBE => {
                self.expect(Expectation::Describe)?;
                Ok(Some(frame))
            }
            frontend::EXECUTE => self.on_execute(frame).await,
            frontend::CLOSE => {
                let target = parse_target(&frame.body)?;
                match target.kind {
                    TargetKind::Statement => self.tracker.close_statement(&target.name),
                    TargetKind::Portal => self.tracker.close_portal(&target.name),
                }
                self.expect(Expectation::Close)?;
                Ok(Some(frame))
            }
            frontend::FUNCTION_CALL => {
                if let Err(denial) = self.admit(None) {
                    self.deny(denial, "<function call>", Protocol::FunctionCall).await?;
                    return Ok(None);
                }
                self.expect(Expectation::Query(PendingExecution::new(
                    "<function call>",
                    Protocol::FunctionCall,
                )))?;
                Ok(Some(frame))
            }
            _ => Ok(Some(frame)),
        }
    }

    async fn on_query(&mut self, frame: Frame) -> Result<Option<Frame>, ProxyError> {
        let sql = parse_query(&frame.body)?;
        if let Err(denial) = self.admit(Some(&sql)) {
            self.deny(denial, &sql, Protocol::Simple).await?;
            return Ok(None);
        }
        self.tracker.apply_simple_query(&sql);
        self.expect(Expectation::Query(PendingExecution::new(sql, Protocol::Simple)))?;
        Ok(Some(frame))
    }

    async fn on_parse(&mut self, frame: Frame) -> Result<Option<Frame>, ProxyError> {
        let parse = parse_parse(&frame.body)?;
        let checked = self
            .check_grant_window()
            .and_then(|()| self.policy.check(&parse.sql).map(|_| ()));
        if let Err(violation) = checked {
            self.deny(violation.into(), &parse.sql, Protocol::Extended).await?;
            return Ok(None);
        }
        self.tracker.parse(&parse.statement, &parse.sql);
        self.expect(Expectation::Parse)?;
        Ok(Some(frame))
    }

    async fn on_execute(&mut self, frame: Frame) -> Result<Option<Frame>, ProxyError> {
        let execute = parse_execute(&frame.body)?;
        // An unknown portal is the server's error to report.
        let sql = self
            .tracker
            .portal_sql(&execute.portal)
            .unwrap_or_default()
            .to_string();

        let admitted = self
            .check_grant_window()
            .map_err(Denial::from)
            .and_then(|()| self.ctx.quota.check_and_reserve_query().map_err(Denial::from));
        if let Err(denial) = admitted {
            self.deny(denial, &sql, Protocol::Extended).await?;
            return Ok(None);
        }
        self.expect(Expectation::Execute(PendingExecution::new(sql, Protocol::Extended)))?;
        Ok(Some(frame))
    }

    /// Grant window, policy (when there is SQL to classify) and quota, in
    /// that order. A query is only counted once everything else passed.
    fn admit(&self, sql: Option<&str>) -> Result<(), Denial> {
        self.check_grant_window()?;
        if let Some(sql) = sql {
            self.policy.check(sql)?;
        }
        self.ctx.quota.check_and_reserve_query()?;
        Ok(())
    }

    fn check_grant_window(&self) -> Result<(), PolicyViolation> {
        self.ctx
            .grant
            .check_active(Utc::now())
            .map_err(PolicyViolation::grant_inactive)
    }

    fn expect(&self, expectation: Expectation) -> Result<(), ProxyError> {
        self.expectations
            .send(expectation)
            .map_err(|_| ProxyError::ProtocolError("response direction has stopped".to_string()))
    }

    async fn deny(&mut self, denial: Denial, sql: &str, protocol: Protocol) -> Result<(), ProxyError> {
        let simple = protocol != Protocol::Extended;
        if !simple {
            self.ignore_till_sync = true;
        }
        self.expect(Expectation::Synthesized {
            frames: vec![denial.to_error_fields().to_frame()],
            ready_for_query: simple,
        })?;

        let preview_len = self.ctx.audit.sql_preview_len();
        let event = match &denial {
            Denial::Policy(violation) => {
                tracing::info!(
                    connection_id = %self.ctx.connection_id,
                    grant_id = %self.ctx.grant.id,
                    reason = violation.reason(),
                    protocol = protocol.as_str(),
                    "Statement blocked"
                );
                self.ctx
                    .event(AuditEventType::QueryBlocked)
                    .sql_preview(sql, preview_len)
                    .reason(violation.reason())
                    .protocol(protocol.as_str())
                    .build()
            }
            Denial::Quota(exceeded) => {
                tracing::info!(
                    connection_id = %self.ctx.connection_id,
                    grant_id = %self.ctx.grant.id,
                    kind = exceeded.kind.as_str(),
                    limit = exceeded.limit,
                    used = exceeded.used,
                    "Quota exceeded"
                );
                self.ctx
                    .event(AuditEventType::QuotaExceeded)
                    .sql_preview(sql, preview_len)
                    .quota(exceeded.kind, exceeded.limit, exceeded.used)
                    .protocol(protocol.as_str())
                    .build()
            }
        };
        self.ctx.audit(event).await;
        Ok(())
    }
}
