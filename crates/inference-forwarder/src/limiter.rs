//! Admission limiter
//!
//! Bounds the number of requests in flight against the backend. The local
//! variant is a tokio semaphore shared by every worker thread of the process.
//! The shared variant keeps leased permits in a Redis sorted set so several
//! forwarder processes on one host draw from a single budget.

use anyhow::Context;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::SharedLimiterConfig;

/// Expired leases are purged, then a new one is added if there is room.
///
/// KEYS[1] = permit set, ARGV = now_ms, capacity, expires_at_ms, token
const ACQUIRE_SCRIPT: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
if redis.call('ZCARD', KEYS[1]) < tonumber(ARGV[2]) then
    redis.call('ZADD', KEYS[1], ARGV[3], ARGV[4])
    return 1
end
return 0
"#;

/// How often a blocking shared acquire re-checks for room
const SHARED_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("Concurrency limit of {0} reached")]
    Saturated(usize),

    #[error("Admission limiter is closed")]
    Closed,

    #[error("Shared admission counter unavailable: {0}")]
    Unavailable(#[from] redis::RedisError),
}

/// One admitted request. Capacity is returned when this is dropped.
#[must_use = "capacity is released as soon as the permit is dropped"]
pub struct Permit {
    _inner: PermitInner,
}

enum PermitInner {
    Local { _permit: OwnedSemaphorePermit },
    Shared { _lease: SharedLease },
}

struct SharedLease {
    conn: ConnectionManager,
    key: String,
    token: String,
}

impl Drop for SharedLease {
    fn drop(&mut self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to release shared permit {}; it will expire", self.token);
            return;
        };

        let mut conn = self.conn.clone();
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            let removed: redis::RedisResult<i64> = conn.zrem(&key, &token).await;
            if let Err(e) = removed {
                warn!("Failed to release shared permit {}: {}", token, e);
            }
        });
    }
}

enum Backend {
    Local(Arc<Semaphore>),
    Shared {
        conn: ConnectionManager,
        key: String,
        lease: Duration,
        script: Script,
    },
}

/// Bounded-concurrency gate for one forwarding configuration
#[derive(Clone)]
pub struct AdmissionLimiter {
    backend: Arc<Backend>,
    capacity: usize,
    fail_fast: bool,
}

impl AdmissionLimiter {
    /// Process-wide limiter
    pub fn local(capacity: usize, fail_fast: bool) -> Self {
        Self {
            backend: Arc::new(Backend::Local(Arc::new(Semaphore::new(capacity)))),
            capacity,
            fail_fast,
        }
    }

    /// Limiter whose counter lives in Redis
    pub async fn shared(
        config: &SharedLimiterConfig,
        capacity: usize,
        fail_fast: bool,
    ) -> anyhow::Result<Self> {
        let client = Client::open(config.redis_url.as_str()).context("Invalid Redis URL")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;

        Ok(Self {
            backend: Arc::new(Backend::Shared {
                conn,
                key: config.key.clone(),
                lease: Duration::from_secs(config.lease_secs),
                script: Script::new(ACQUIRE_SCRIPT),
            }),
            capacity,
            fail_fast,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free local permits; `None` for the shared variant
    pub fn available(&self) -> Option<usize> {
        match self.backend.as_ref() {
            Backend::Local(semaphore) => Some(semaphore.available_permits()),
            Backend::Shared { .. } => None,
        }
    }

    /// Admit one request, failing fast or waiting for room per policy
    pub async fn acquire(&self) -> Result<Permit, LimiterError> {
        match self.backend.as_ref() {
            Backend::Local(semaphore) => {
                let permit = if self.fail_fast {
                    semaphore.clone().try_acquire_owned().map_err(|e| match e {
                        tokio::sync::TryAcquireError::NoPermits => {
                            LimiterError::Saturated(self.capacity)
                        }
                        tokio::sync::TryAcquireError::Closed => LimiterError::Closed,
                    })?
                } else {
                    semaphore
                        .clone()
                        .acquire_owned()
                        .await
                        .map_err(|_| LimiterError::Closed)?
                };

                Ok(Permit {
                    _inner: PermitInner::Local { _permit: permit },
                })
            }
            Backend::Shared {
                conn,
                key,
                lease,
                script,
            } => {
                let token = Uuid::new_v4().to_string();
                loop {
                    if self.try_lease(conn, key, *lease, script, &token).await? {
                        debug!("Leased shared permit {}", token);
                        return Ok(Permit {
                            _inner: PermitInner::Shared {
                                _lease: SharedLease {
                                    conn: conn.clone(),
                                    key: key.clone(),
                                    token,
                                },
                            },
                        });
                    }

                    if self.fail_fast {
                        return Err(LimiterError::Saturated(self.capacity));
                    }
                    tokio::time::sleep(SHARED_POLL_INTERVAL).await;
                }
            }
        }
    }

    async fn try_lease(
        &self,
        conn: &ConnectionManager,
        key: &str,
        lease: Duration,
        script: &Script,
        token: &str,
    ) -> Result<bool, LimiterError> {
        let now = chrono::Utc::now().timestamp_millis();
        let expires_at = now + lease.as_millis() as i64;

        let mut conn = conn.clone();
        let admitted: i64 = script
            .key(key)
            .arg(now)
            .arg(self.capacity)
            .arg(expires_at)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;

        Ok(admitted == 1)
    }
}
