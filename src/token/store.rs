//! Refresh-token storage.
//!
//! Each login creates a token *family*: a chain of refresh tokens where only
//! the newest member is redeemable. The store keeps one record per family and
//! exposes a compare-and-swap on the current secret hash; that CAS is the
//! linearization point that makes rotation single-flight.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Current state of one refresh-token family.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshRecord {
    pub family: Uuid,
    pub user_id: Uuid,
    /// SHA-256 of the currently redeemable refresh secret.
    pub current_hash: Vec<u8>,
    /// `jti` of the access token minted alongside the current refresh token.
    pub access_jti: String,
    pub issued_at: i64,
    pub expires_at: i64,
}

/// Result of the rotation compare-and-swap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapOutcome {
    /// The presented hash was current; the family now points at the new one.
    Rotated,
    /// The presented hash was already rotated away. Someone else won.
    Reused,
    /// No such family (revoked, expired out, or never issued).
    Missing,
}

/// Storage seam for refresh-token families.
///
/// `compare_and_swap` must be atomic per family: of any number of concurrent
/// callers presenting the same `expected_hash`, exactly one may observe
/// [`SwapOutcome::Rotated`].
#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    async fn insert(&self, record: RefreshRecord) -> Result<()>;

    async fn get(&self, family: Uuid) -> Result<Option<RefreshRecord>>;

    async fn compare_and_swap(
        &self,
        family: Uuid,
        expected_hash: &[u8],
        new_hash: Vec<u8>,
        new_access_jti: String,
        new_expires_at: i64,
    ) -> Result<SwapOutcome>;

    /// Revoke one family. Idempotent.
    async fn remove(&self, family: Uuid) -> Result<()>;

    /// Revoke every family belonging to `user_id`, except the given one.
    async fn remove_for_user(&self, user_id: Uuid, except: Option<Uuid>) -> Result<()>;
}

/// In-process store. A single mutex over the family map is enough: rotation
/// is one small map operation, and contention is bounded by concurrent
/// refreshes, not by request volume.
#[derive(Debug, Default)]
pub struct MemoryRefreshTokenStore {
    families: Mutex<HashMap<Uuid, RefreshRecord>>,
}

impl MemoryRefreshTokenStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RefreshTokenStore for MemoryRefreshTokenStore {
    async fn insert(&self, record: RefreshRecord) -> Result<()> {
        let mut families = self.families.lock().await;
        families.insert(record.family, record);
        Ok(())
    }

    async fn get(&self, family: Uuid) -> Result<Option<RefreshRecord>> {
        let families = self.families.lock().await;
        Ok(families.get(&family).cloned())
    }

    async fn compare_and_swap(
        &self,
        family: Uuid,
        expected_hash: &[u8],
        new_hash: Vec<u8>,
        new_access_jti: String,
        new_expires_at: i64,
    ) -> Result<SwapOutcome> {
        let mut families = self.families.lock().await;
        let Some(record) = families.get_mut(&family) else {
            return Ok(SwapOutcome::Missing);
        };
        if record.current_hash != expected_hash {
            return Ok(SwapOutcome::Reused);
        }
        record.current_hash = new_hash;
        record.access_jti = new_access_jti;
        record.expires_at = new_expires_at;
        Ok(SwapOutcome::Rotated)
    }

    async fn remove(&self, family: Uuid) -> Result<()> {
        let mut families = self.families.lock().await;
        families.remove(&family);
        Ok(())
    }

    async fn remove_for_user(&self, user_id: Uuid, except: Option<Uuid>) -> Result<()> {
        let mut families = self.families.lock().await;
        families.retain(|family, record| record.user_id != user_id || Some(*family) == except);
        Ok(())
    }
}
