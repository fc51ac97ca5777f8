//! Stream admission control.
//!
//! Two counters gate every new stream connection: a per-owner cap and a
//! global cap. Either at capacity rejects the newcomer and leaves
//! existing connections untouched. The counters sit behind a trait so a
//! multi-instance deployment can swap the process-local map for a shared
//! Redis counter without touching broadcaster logic; the in-memory
//! implementation does not coordinate across instances.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use log::{debug, warn};
use redis::AsyncCommands;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("owner {owner_id} is at the concurrent stream limit ({limit})")]
    OwnerAtCapacity { owner_id: String, limit: u32 },

    #[error("global concurrent stream limit reached ({limit})")]
    GlobalAtCapacity { limit: u32 },

    #[error("admission backend failure: {0}")]
    Backend(String),
}

impl AdmissionError {
    pub fn code(&self) -> &'static str {
        match self {
            AdmissionError::OwnerAtCapacity { .. } | AdmissionError::GlobalAtCapacity { .. } => {
                "too-many-connections"
            }
            AdmissionError::Backend(_) => "internal",
        }
    }
}

/// Counter backend for stream admission.
#[async_trait]
pub trait AdmissionControl: Send + Sync {
    /// Reserve one slot for this owner, or report which cap is full.
    async fn try_admit(&self, owner_id: &str) -> Result<(), AdmissionError>;

    /// Give one slot back.
    async fn release(&self, owner_id: &str);
}

/// One admitted connection's slot. Releasing is idempotent: whichever
/// close trigger gets here first wins, later calls are no-ops.
pub struct AdmissionTicket {
    owner_id: String,
    control: Arc<dyn AdmissionControl>,
    released: AtomicBool,
}

impl std::fmt::Debug for AdmissionTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionTicket")
            .field("owner_id", &self.owner_id)
            .field("released", &self.released)
            .finish()
    }
}

impl AdmissionTicket {
    pub async fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.control.release(&self.owner_id).await;
        }
    }
}

impl Drop for AdmissionTicket {
    // Backstop for tickets dropped before their connection ever ran,
    // e.g. a WebSocket handshake that dies between admit and upgrade.
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            let control = self.control.clone();
            let owner_id = std::mem::take(&mut self.owner_id);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { control.release(&owner_id).await });
            }
        }
    }
}

/// Reserve a slot and wrap it in a release-once ticket.
pub async fn admit(
    control: Arc<dyn AdmissionControl>,
    owner_id: &str,
) -> Result<AdmissionTicket, AdmissionError> {
    control.try_admit(owner_id).await?;
    Ok(AdmissionTicket {
        owner_id: owner_id.to_string(),
        control,
        released: AtomicBool::new(false),
    })
}

#[derive(Default)]
struct Counts {
    per_owner: HashMap<String, u32>,
    total: u32,
}

/// Process-local counters under a mutex.
pub struct InMemoryAdmission {
    per_owner_limit: u32,
    global_limit: u32,
    counts: StdMutex<Counts>,
}

impl InMemoryAdmission {
    pub fn new(per_owner_limit: u32, global_limit: u32) -> Self {
        Self {
            per_owner_limit,
            global_limit,
            counts: StdMutex::new(Counts::default()),
        }
    }
}

#[async_trait]
impl AdmissionControl for InMemoryAdmission {
    async fn try_admit(&self, owner_id: &str) -> Result<(), AdmissionError> {
        let mut counts = self.counts.lock().expect("admission mutex poisoned");
        let owner_count = counts.per_owner.get(owner_id).copied().unwrap_or(0);
        if owner_count >= self.per_owner_limit {
            return Err(AdmissionError::OwnerAtCapacity {
                owner_id: owner_id.to_string(),
                limit: self.per_owner_limit,
            });
        }
        if counts.total >= self.global_limit {
            return Err(AdmissionError::GlobalAtCapacity {
                limit: self.global_limit,
            });
        }
        counts.per_owner.insert(owner_id.to_string(), owner_count + 1);
        counts.total += 1;
        Ok(())
    }

    async fn release(&self, owner_id: &str) {
        let mut counts = self.counts.lock().expect("admission mutex poisoned");
        match counts.per_owner.get_mut(owner_id) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                counts.per_owner.remove(owner_id);
            }
            None => debug!("release for owner {owner_id} with no admitted streams"),
        }
        counts.total = counts.total.saturating_sub(1);
    }
}

const OWNER_KEY_PREFIX: &str = "stream:owner:";
const GLOBAL_KEY: &str = "stream:global";

/// Redis-backed counters shared across service instances.
///
/// Slots are reserved with INCR and unwound on rejection, so a burst of
/// rejected connections never leaks capacity.
pub struct RedisAdmission {
    client: Arc<redis::Client>,
    per_owner_limit: u32,
    global_limit: u32,
}

impl RedisAdmission {
    pub fn new(client: Arc<redis::Client>, per_owner_limit: u32, global_limit: u32) -> Self {
        Self {
            client,
            per_owner_limit,
            global_limit,
        }
    }

    fn owner_key(owner_id: &str) -> String {
        format!("{OWNER_KEY_PREFIX}{owner_id}:count")
    }
}

#[async_trait]
impl AdmissionControl for RedisAdmission {
    async fn try_admit(&self, owner_id: &str) -> Result<(), AdmissionError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| AdmissionError::Backend(e.to_string()))?;

        let owner_key = Self::owner_key(owner_id);
        let owner_count: i64 = conn
            .incr(&owner_key, 1i64)
            .await
            .map_err(|e| AdmissionError::Backend(e.to_string()))?;
        if owner_count > i64::from(self.per_owner_limit) {
            let _: Result<i64, _> = conn.decr(&owner_key, 1i64).await;
            return Err(AdmissionError::OwnerAtCapacity {
                owner_id: owner_id.to_string(),
                limit: self.per_owner_limit,
            });
        }

        let global_count: i64 = match conn.incr(GLOBAL_KEY, 1i64).await {
            Ok(count) => count,
            Err(e) => {
                let _: Result<i64, _> = conn.decr(&owner_key, 1i64).await;
                return Err(AdmissionError::Backend(e.to_string()));
            }
        };
        if global_count > i64::from(self.global_limit) {
            let _: Result<i64, _> = conn.decr(GLOBAL_KEY, 1i64).await;
            let _: Result<i64, _> = conn.decr(&owner_key, 1i64).await;
            return Err(AdmissionError::GlobalAtCapacity {
                limit: self.global_limit,
            });
        }

        Ok(())
    }

    async fn release(&self, owner_id: &str) {
        let Ok(mut conn) = self.client.get_multiplexed_async_connection().await else {
            warn!("admission release lost: redis unavailable");
            return;
        };
        let _: Result<i64, _> = conn.decr(Self::owner_key(owner_id), 1i64).await;
        let _: Result<i64, _> = conn.decr(GLOBAL_KEY, 1i64).await;
    }
}
