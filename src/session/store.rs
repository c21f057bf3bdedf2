//! Session storage.
//!
//! Sessions are keyed by the SHA-256 of the opaque session token; raw tokens
//! never touch the store. Ended sessions are kept (flagged revoked) instead of
//! deleted so a later validation can tell "you were signed out" apart from
//! "never logged in".

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Advisory client identification captured at login. Never used as an
/// authentication factor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientFingerprint {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub device: Option<String>,
}

/// One authenticated client connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionRecord {
    pub user_id: Uuid,
    /// Refresh-token family issued together with this session; revoked with it.
    pub token_family: Uuid,
    pub fingerprint: ClientFingerprint,
    pub created_at: i64,
    pub last_activity_at: i64,
    pub expires_at: i64,
    pub revoked: bool,
}

impl SessionRecord {
    #[must_use]
    pub fn is_active(&self, now: i64) -> bool {
        !self.revoked && now < self.expires_at
    }
}

/// Storage seam for the session registry.
///
/// Lookups are by hash and must be O(1)-ish: validation runs on nearly every
/// authenticated request.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, hash: Vec<u8>, record: SessionRecord) -> Result<()>;

    async fn get(&self, hash: &[u8]) -> Result<Option<SessionRecord>>;

    /// Replace the stored record (used by keep-alive extension).
    async fn update(&self, hash: &[u8], record: SessionRecord) -> Result<()>;

    /// Flag a session revoked. Unknown or already-revoked hashes are a no-op.
    async fn revoke(&self, hash: &[u8]) -> Result<()>;

    /// Flag every session of `user_id` revoked, except the given hash.
    async fn revoke_for_user(&self, user_id: Uuid, except: Option<&[u8]>) -> Result<u64>;

    /// Non-revoked, unexpired sessions for a user, with their hashes.
    async fn active_for_user(&self, user_id: Uuid, now: i64)
        -> Result<Vec<(Vec<u8>, SessionRecord)>>;

    /// Drop sessions whose expiry is comfortably in the past. Expiry is
    /// otherwise lazy; this keeps the table from growing without bound.
    async fn sweep_expired(&self, now: i64) -> Result<u64>;
}

/// How long an expired or revoked row lingers before the sweeper may drop it.
/// The grace period keeps the "session ended" signal observable for clients
/// that reconnect shortly after a forced sign-out.
pub const SWEEP_GRACE_SECONDS: i64 = 24 * 60 * 60;

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<Vec<u8>, SessionRecord>>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, hash: Vec<u8>, record: SessionRecord) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        sessions.insert(hash, record);
        Ok(())
    }

    async fn get(&self, hash: &[u8]) -> Result<Option<SessionRecord>> {
        let sessions = self.sessions.lock().await;
        Ok(sessions.get(hash).cloned())
    }

    async fn update(&self, hash: &[u8], record: SessionRecord) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        if let Some(stored) = sessions.get_mut(hash) {
            *stored = record;
        }
        Ok(())
    }

    async fn revoke(&self, hash: &[u8]) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        if let Some(record) = sessions.get_mut(hash) {
            record.revoked = true;
        }
        Ok(())
    }

    async fn revoke_for_user(&self, user_id: Uuid, except: Option<&[u8]>) -> Result<u64> {
        let mut sessions = self.sessions.lock().await;
        let mut revoked = 0;
        for (hash, record) in sessions.iter_mut() {
            if record.user_id == user_id && !record.revoked && Some(hash.as_slice()) != except {
                record.revoked = true;
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn active_for_user(
        &self,
        user_id: Uuid,
        now: i64,
    ) -> Result<Vec<(Vec<u8>, SessionRecord)>> {
        let sessions = self.sessions.lock().await;
        Ok(sessions
            .iter()
            .filter(|(_, record)| record.user_id == user_id && record.is_active(now))
            .map(|(hash, record)| (hash.clone(), record.clone()))
            .collect())
    }

    async fn sweep_expired(&self, now: i64) -> Result<u64> {
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, record| record.expires_at + SWEEP_GRACE_SECONDS > now);
        Ok((before - sessions.len()) as u64)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::{
        ClientFingerprint, MemorySessionStore, SWEEP_GRACE_SECONDS, SessionRecord, SessionStore,
    };
    use uuid::Uuid;

    fn record(user_id: Uuid, created_at: i64, expires_at: i64) -> SessionRecord {
        SessionRecord {
            user_id,
            token_family: Uuid::new_v4(),
            fingerprint: ClientFingerprint::default(),
            created_at,
            last_activity_at: created_at,
            expires_at,
            revoked: false,
        }
    }

    #[tokio::test]
    async fn revoke_keeps_the_record_visible() {
        let store = MemorySessionStore::new();
        let user = Uuid::new_v4();
        store.insert(b"h1".to_vec(), record(user, 100, 200)).await.unwrap();

        store.revoke(b"h1").await.unwrap();
        let stored = store.get(b"h1").await.unwrap().unwrap();
        assert!(stored.revoked);

        // Revoking again, or revoking the unknown, is a quiet no-op.
        store.revoke(b"h1").await.unwrap();
        store.revoke(b"missing").await.unwrap();
    }

    #[tokio::test]
    async fn revoke_for_user_spares_exception() {
        let store = MemorySessionStore::new();
        let user = Uuid::new_v4();
        store.insert(b"a".to_vec(), record(user, 100, 900)).await.unwrap();
        store.insert(b"b".to_vec(), record(user, 100, 900)).await.unwrap();
        store
            .insert(b"c".to_vec(), record(Uuid::new_v4(), 100, 900))
            .await
            .unwrap();

        let revoked = store
            .revoke_for_user(user, Some(b"a".as_slice()))
            .await
            .unwrap();
        assert_eq!(revoked, 1);
        assert!(!store.get(b"a").await.unwrap().unwrap().revoked);
        assert!(store.get(b"b").await.unwrap().unwrap().revoked);
        assert!(!store.get(b"c").await.unwrap().unwrap().revoked);
    }

    #[tokio::test]
    async fn active_for_user_filters_revoked_and_expired() {
        let store = MemorySessionStore::new();
        let user = Uuid::new_v4();
        store.insert(b"live".to_vec(), record(user, 100, 900)).await.unwrap();
        store.insert(b"old".to_vec(), record(user, 100, 400)).await.unwrap();
        let mut revoked = record(user, 100, 900);
        revoked.revoked = true;
        store.insert(b"gone".to_vec(), revoked).await.unwrap();

        let active = store.active_for_user(user, 500).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].0, b"live");
    }

    #[tokio::test]
    async fn sweep_respects_grace_period() {
        let store = MemorySessionStore::new();
        let user = Uuid::new_v4();
        store.insert(b"old".to_vec(), record(user, 0, 100)).await.unwrap();
        store.insert(b"new".to_vec(), record(user, 0, 1_000)).await.unwrap();

        // Just past expiry: still within grace, nothing dropped.
        assert_eq!(store.sweep_expired(200).await.unwrap(), 0);

        let swept = store
            .sweep_expired(100 + SWEEP_GRACE_SECONDS + 1)
            .await
            .unwrap();
        assert_eq!(swept, 1);
        assert!(store.get(b"old").await.unwrap().is_none());
        assert!(store.get(b"new").await.unwrap().is_some());
    }
}
