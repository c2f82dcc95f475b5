//! Collaborator implementations backed by the configuration file.
//!
//! Grants and their usage counters live in memory for the lifetime of the
//! process. A deployment with a management plane replaces these with clients
//! of its own store.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use argon2::password_hash::{rand_core::OsRng, PasswordHasher, SaltString};
use argon2::{Argon2, PasswordHash, PasswordVerifier};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgrant_core::{DenialReason, Grant, PgrantConfig, QuotaKind, UpstreamConfig};

use crate::collaborators::{
    Authenticator, CredentialProvider, GrantResolver, QuotaStatus, QuotaStore, UpstreamCredentials,
};
use crate::error::ProxyError;

/// Hash a password into an Argon2id PHC string.
pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    Ok(Argon2::default()
        .hash_password(password.as_bytes(), &salt)?
        .to_string())
}

/// Checks passwords against Argon2 hashes.
#[derive(Debug, Default)]
pub struct ConfigAuthenticator {
    users: HashMap<String, String>,
}

impl ConfigAuthenticator {
    /// `users` maps login names to PHC hashes.
    pub fn new(users: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            users: users.into_iter().collect(),
        }
    }

    pub fn from_config(config: &PgrantConfig) -> Self {
        Self::new(
            config
                .users
                .iter()
                .map(|u| (u.name.clone(), u.password_hash.clone())),
        )
    }
}

#[async_trait]
impl Authenticator for ConfigAuthenticator {
    async fn authenticate(&self, user: &str, password: &str) -> Result<bool, ProxyError> {
        let Some(hash) = self.users.get(user).cloned() else {
            return Ok(false);
        };
        let password = password.to_string();

        // Argon2 is deliberately slow; keep it off the reactor.
        let verified = tokio::task::spawn_blocking(move || -> anyhow::Result<bool> {
            let parsed = PasswordHash::new(&hash)
                .map_err(|e| anyhow::anyhow!("invalid password hash: {}", e))?;
            Ok(Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok())
        })
        .await
        .map_err(|e| ProxyError::Internal(e.into()))??;
        Ok(verified)
    }
}

/// Grants with their usage counters. Serves as both the grant resolver and
/// the quota store.
#[derive(Debug, Default)]
pub struct MemoryGrantStore {
    grants: RwLock<Vec<Grant>>,
}

impl MemoryGrantStore {
    pub fn new(grants: Vec<Grant>) -> Self {
        Self {
            grants: RwLock::new(grants),
        }
    }

    pub fn from_config(config: &PgrantConfig) -> Self {
        Self::new(config.grants.clone())
    }

    /// Snapshot of a grant, usage included.
    pub fn grant(&self, id: &str) -> Option<Grant> {
        self.grants
            .read()
            .ok()?
            .iter()
            .find(|g| g.id == id)
            .cloned()
    }

    /// Mark a grant revoked. Returns whether it exists.
    pub fn revoke(&self, id: &str, at: DateTime<Utc>) -> bool {
        let Ok(mut grants) = self.grants.write() else {
            return false;
        };
        match grants.iter_mut().find(|g| g.id == id) {
            Some(grant) => {
                grant.revoked_at = Some(at);
                true
            }
            None => false,
        }
    }

    fn resolve_at(&self, user: &str, database: &str, now: DateTime<Utc>) -> Result<Grant, DenialReason> {
        let grants = self.grants.read().map_err(|_| DenialReason::NoGrant)?;
        let mut candidates: Vec<&Grant> = grants
            .iter()
            .filter(|g| g.user == user && g.database == database)
            .collect();
        if candidates.is_empty() {
            return Err(DenialReason::NoGrant);
        }

        // Latest expiry first: it is the most useful active grant and, when
        // none is active, the most telling denial.
        candidates.sort_by(|a, b| b.expires_at.cmp(&a.expires_at));
        if let Some(active) = candidates.iter().find(|g| g.check_active(now).is_ok()) {
            return Ok((*active).clone());
        }
        match candidates[0].check_active(now) {
            Err(reason) => Err(reason),
            Ok(()) => Err(DenialReason::NoGrant),
        }
    }

    fn with_grant<T>(
        &self,
        grant_id: &str,
        f: impl FnOnce(&mut Grant) -> T,
    ) -> Result<T, ProxyError> {
        let mut grants = self
            .grants
            .write()
            .map_err(|e| ProxyError::QuotaStore(format!("Failed to acquire write lock: {}", e)))?;
        let grant = grants
            .iter_mut()
            .find(|g| g.id == grant_id)
            .ok_or_else(|| ProxyError::QuotaStore(format!("unknown grant {}", grant_id)))?;
        Ok(f(grant))
    }
}

#[async_trait]
impl GrantResolver for MemoryGrantStore {
    async fn resolve_grant(&self, user: &str, database: &str) -> Result<Grant, DenialReason> {
        self.resolve_at(user, database, Utc::now())
    }
}

#[async_trait]
impl QuotaStore for MemoryGrantStore {
    async fn check_quota(&self, grant_id: &str, kind: QuotaKind) -> Result<QuotaStatus, ProxyError> {
        self.with_grant(grant_id, |grant| match grant.limit(kind) {
            Some(limit) if grant.usage(kind) >= limit => QuotaStatus::Exceeded,
            _ => QuotaStatus::Ok,
        })
    }

    async fn increment_usage(
        &self,
        grant_id: &str,
        kind: QuotaKind,
        amount: u64,
    ) -> Result<QuotaStatus, ProxyError> {
        self.with_grant(grant_id, |grant| {
            let counter = match kind {
                QuotaKind::Queries => &mut grant.query_count,
                QuotaKind::Bytes => &mut grant.bytes_transferred,
            };
            *counter = counter.saturating_add(amount);
            match grant.limit(kind) {
                Some(limit) if grant.usage(kind) > limit => QuotaStatus::Exceeded,
                _ => QuotaStatus::Ok,
            }
        })
    }
}

/// Upstream credentials straight from the `upstreams` section.
#[derive(Debug, Default)]
pub struct ConfigCredentialProvider {
    upstreams: BTreeMap<String, UpstreamConfig>,
}

impl ConfigCredentialProvider {
    pub fn new(upstreams: BTreeMap<String, UpstreamConfig>) -> Self {
        Self { upstreams }
    }

    pub fn from_config(config: &PgrantConfig) -> Self {
        Self::new(config.upstreams.clone())
    }
}

#[async_trait]
impl CredentialProvider for ConfigCredentialProvider {
    async fn upstream_credentials(
        &self,
        database: &str,
    ) -> Result<UpstreamCredentials, ProxyError> {
        let upstream = self
            .upstreams
            .get(database)
            .ok_or_else(|| ProxyError::UnknownDatabase(database.to_string()))?;
        Ok(UpstreamCredentials {
            host: upstream.host.clone(),
            port: upstream.port,
            database: upstream
                .database
                .clone()
                .unwrap_or_else(|| database.to_string()),
            username: upstream.username.clone(),
            password: upstream.resolve_password(),
            ssl_mode: upstream.ssl_mode,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn grant(id: &str, starts: DateTime<Utc>, expires: DateTime<Utc>) -> Grant {
        Grant::new(id, "alice", "sales", starts, expires)
    }

    #[tokio::test]
    async fn test_authenticator() {
        let hash = hash_password("s3cret").unwrap();
        let auth = ConfigAuthenticator::new([("alice".to_string(), hash)]);
        assert!(auth.authenticate("alice", "s3cret").await.unwrap());
        assert!(!auth.authenticate("alice", "wrong").await.unwrap());
        assert!(!auth.authenticate("bob", "s3cret").await.unwrap());
    }

    #[test]
    fn test_resolve_prefers_active_grant() {
        let now = Utc::now();
        let store = MemoryGrantStore::new(vec![
            grant("old", now - Duration::days(10), now - Duration::days(5)),
            grant("current", now - Duration::hours(1), now + Duration::hours(1)),
        ]);
        assert_eq!(store.resolve_at("alice", "sales", now).unwrap().id, "current");
        assert_eq!(
            store.resolve_at("alice", "hr", now),
            Err(DenialReason::NoGrant)
        );
        assert_eq!(
            store.resolve_at("alice", "sales", now + Duration::days(1)),
            Err(DenialReason::Expired)
        );
        assert_eq!(
            store.resolve_at("alice", "sales", now - Duration::days(20)),
            Err(DenialReason::NotStarted)
        );

        assert!(store.revoke("current", now - Duration::minutes(1)));
        assert_eq!(
            store.resolve_at("alice", "sales", now),
            Err(DenialReason::Revoked)
        );
    }

    #[tokio::test]
    async fn test_quota_counters() {
        let now = Utc::now();
        let store = MemoryGrantStore::new(vec![
            grant("g1", now, now + Duration::hours(1)).with_max_query_counts(2),
        ]);

        assert_eq!(store.check_quota("g1", QuotaKind::Queries).await.unwrap(), QuotaStatus::Ok);
        assert_eq!(
            store.increment_usage("g1", QuotaKind::Queries, 2).await.unwrap(),
            QuotaStatus::Ok
        );
        assert_eq!(
            store.check_quota("g1", QuotaKind::Queries).await.unwrap(),
            QuotaStatus::Exceeded
        );
        assert_eq!(
            store.increment_usage("g1", QuotaKind::Queries, 1).await.unwrap(),
            QuotaStatus::Exceeded
        );
        // Unlimited kind never runs out.
        assert_eq!(
            store.increment_usage("g1", QuotaKind::Bytes, 1 << 40).await.unwrap(),
            QuotaStatus::Ok
        );
        assert_eq!(store.grant("g1").unwrap().query_count, 3);
        assert!(store.check_quota("nope", QuotaKind::Queries).await.is_err());
    }

    #[tokio::test]
    async fn test_credentials_default_database_name() {
        let mut upstreams = BTreeMap::new();
        upstreams.insert(
            "sales".to_string(),
            UpstreamConfig {
                host: "db.internal".to_string(),
                password: Some("pw".to_string()),
                ..Default::default()
            },
        );
        let provider = ConfigCredentialProvider::new(upstreams);
        let creds = provider.upstream_credentials("sales").await.unwrap();
        assert_eq!(creds.database, "sales");
        assert_eq!(creds.password.as_deref(), Some("pw"));
        assert!(!format!("{creds:?}").contains("pw\""));
        assert!(matches!(
            provider.upstream_credentials("hr").await,
            Err(ProxyError::UnknownDatabase(_))
        ));
    }
}
