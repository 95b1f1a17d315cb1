//! Per-endpoint mutation lock
//!
//! At most one mutation (create, update, delete, or a reconciler write) may be
//! initiated for an endpoint at a time. A claim is a lease: it carries a
//! random token and expires on its own, so a crashed holder cannot wedge an
//! endpoint forever. Release only succeeds for the token that claimed it.

use anyhow::Result;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::error::UseCaseError;

/// Compare-and-delete: only the holder of the token may release
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// A held claim on one endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationClaim {
    pub endpoint_id: String,
    pub token: String,
}

impl MutationClaim {
    fn new(endpoint_id: &str) -> Self {
        Self {
            endpoint_id: endpoint_id.to_string(),
            token: uuid::Uuid::new_v4().to_string(),
        }
    }
}

#[async_trait]
pub trait ConflictGuard: Send + Sync {
    /// Atomically claim the endpoint. `Ok(None)` means someone else holds it.
    async fn try_claim(&self, endpoint_id: &str) -> Result<Option<MutationClaim>>;

    /// Release a claim. `Ok(false)` means the lease had already expired or
    /// been taken over.
    async fn release(&self, claim: &MutationClaim) -> Result<bool>;
}

/// Lease-based guard shared by every orchestrator instance through Redis
pub struct RedisConflictGuard {
    conn: ConnectionManager,
    lease: Duration,
}

impl RedisConflictGuard {
    pub fn new(conn: ConnectionManager, lease: Duration) -> Self {
        Self { conn, lease }
    }

    fn lock_key(endpoint_id: &str) -> String {
        format!("endpoint_lock:{}", endpoint_id)
    }
}

#[async_trait]
impl ConflictGuard for RedisConflictGuard {
    async fn try_claim(&self, endpoint_id: &str) -> Result<Option<MutationClaim>> {
        let mut conn = self.conn.clone();
        let claim = MutationClaim::new(endpoint_id);

        // SET NX PX - claim with lease
        let set_result: Option<String> = redis::cmd("SET")
            .arg(Self::lock_key(endpoint_id))
            .arg(&claim.token)
            .arg("NX")
            .arg("PX")
            .arg(self.lease.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        if set_result.is_none() {
            debug!("Endpoint {} already claimed", endpoint_id);
            return Ok(None);
        }

        Ok(Some(claim))
    }

    async fn release(&self, claim: &MutationClaim) -> Result<bool> {
        let mut conn = self.conn.clone();

        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(Self::lock_key(&claim.endpoint_id))
            .arg(&claim.token)
            .invoke_async(&mut conn)
            .await?;

        Ok(deleted == 1)
    }
}

/// Single-process guard for mock mode and tests
pub struct InMemoryConflictGuard {
    claims: Mutex<HashMap<String, (String, Instant)>>,
    lease: Duration,
}

impl InMemoryConflictGuard {
    pub fn new(lease: Duration) -> Self {
        Self {
            claims: Mutex::new(HashMap::new()),
            lease,
        }
    }
}

impl Default for InMemoryConflictGuard {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

#[async_trait]
impl ConflictGuard for InMemoryConflictGuard {
    async fn try_claim(&self, endpoint_id: &str) -> Result<Option<MutationClaim>> {
        let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        if let Some((_, expires_at)) = claims.get(endpoint_id) {
            if *expires_at > now {
                return Ok(None);
            }
        }

        let claim = MutationClaim::new(endpoint_id);
        claims.insert(endpoint_id.to_string(), (claim.token.clone(), now + self.lease));
        Ok(Some(claim))
    }

    async fn release(&self, claim: &MutationClaim) -> Result<bool> {
        let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());

        match claims.get(&claim.endpoint_id) {
            Some((token, _)) if *token == claim.token => {
                claims.remove(&claim.endpoint_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Run `op` while holding the endpoint's claim.
///
/// Fails with `OperationInProgress` without running `op` when the endpoint is
/// already claimed. The claim is released once `op` returns, whatever the
/// outcome; infra convergence afterwards is tracked by status, not the lock.
pub async fn run_exclusive<T, Fut>(
    guard: &dyn ConflictGuard,
    endpoint_id: &str,
    op: Fut,
) -> Result<T, UseCaseError>
where
    Fut: Future<Output = Result<T, UseCaseError>>,
{
    let claim = guard
        .try_claim(endpoint_id)
        .await?
        .ok_or_else(|| UseCaseError::OperationInProgress(endpoint_id.to_string()))?;

    let result = op.await;

    match guard.release(&claim).await {
        Ok(true) => {}
        Ok(false) => warn!(
            "Claim on {} expired before release; lease may be too short",
            endpoint_id
        ),
        Err(e) => error!("Failed to release claim on {}: {:#}", endpoint_id, e),
    }

    result
}
