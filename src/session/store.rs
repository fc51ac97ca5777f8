//! Transactional session store.
//!
//! The store exposes one locking primitive: [`SessionStore::lock_for_update`]
//! returns a transaction handle holding an exclusive lock on the session
//! row. Mutation happens on a copy and becomes visible only through
//! [`SessionTxn::commit`]; dropping the handle without committing is a
//! full rollback. Any storage technology offering serializable or
//! row-locking reads can implement this contract; the in-memory
//! implementation here backs tests and single-instance deployments.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::session::error::StoreError;
use crate::session::types::{PaymentSession, SessionFilter, SessionPage};

/// Storage contract for payment sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a new session. Fails with
    /// [`StoreError::DuplicateIdempotencyKey`] when the session carries a
    /// key already present for its owner.
    async fn insert(&self, session: PaymentSession) -> Result<(), StoreError>;

    /// Fetch a session, scoped to its owner.
    async fn get(&self, owner_id: &str, id: &str) -> Result<Option<PaymentSession>, StoreError>;

    /// Look up the session holding `(owner_id, key)`, if any.
    async fn find_by_idempotency_key(
        &self,
        owner_id: &str,
        key: &str,
    ) -> Result<Option<PaymentSession>, StoreError>;

    /// List an owner's sessions, filtered and paginated, newest-last.
    async fn list(
        &self,
        owner_id: &str,
        filter: &SessionFilter,
    ) -> Result<SessionPage, StoreError>;

    /// Acquire the exclusive row lock for one session. Concurrent calls
    /// for the same session serialize; unrelated sessions are unaffected.
    /// Returns `None` when the session does not exist for this owner.
    async fn lock_for_update(
        &self,
        owner_id: &str,
        id: &str,
    ) -> Result<Option<Box<dyn SessionTxn>>, StoreError>;
}

/// An exclusive, in-flight update on one session row.
#[async_trait]
pub trait SessionTxn: Send {
    /// The committed state the lock was acquired on.
    fn session(&self) -> &PaymentSession;

    /// Write back the updated row and release the lock. Dropping the
    /// handle without calling this rolls the update back.
    async fn commit(self: Box<Self>, updated: PaymentSession) -> Result<(), StoreError>;
}

type Row = Arc<AsyncMutex<PaymentSession>>;

#[derive(Default)]
struct Inner {
    rows: HashMap<String, Row>,
    by_key: HashMap<(String, String), String>,
    creation_order: Vec<String>,
}

/// In-memory store: one async mutex per row for update serialization, a
/// sync map mutex for index operations (never held across await).
#[derive(Default)]
pub struct InMemorySessionStore {
    inner: StdMutex<Inner>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn row(&self, id: &str) -> Option<Row> {
        self.inner
            .lock()
            .expect("store mutex poisoned")
            .rows
            .get(id)
            .cloned()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn insert(&self, session: PaymentSession) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        if let Some(key) = &session.idempotency_key {
            let index_key = (session.owner_id.clone(), key.clone());
            if inner.by_key.contains_key(&index_key) {
                return Err(StoreError::DuplicateIdempotencyKey);
            }
            inner.by_key.insert(index_key, session.id.clone());
        }
        inner.creation_order.push(session.id.clone());
        inner
            .rows
            .insert(session.id.clone(), Arc::new(AsyncMutex::new(session)));
        Ok(())
    }

    async fn get(&self, owner_id: &str, id: &str) -> Result<Option<PaymentSession>, StoreError> {
        let Some(row) = self.row(id) else {
            return Ok(None);
        };
        let session = row.lock().await;
        if session.owner_id != owner_id {
            return Ok(None);
        }
        Ok(Some(session.clone()))
    }

    async fn find_by_idempotency_key(
        &self,
        owner_id: &str,
        key: &str,
    ) -> Result<Option<PaymentSession>, StoreError> {
        let id = {
            let inner = self.inner.lock().expect("store mutex poisoned");
            inner
                .by_key
                .get(&(owner_id.to_string(), key.to_string()))
                .cloned()
        };
        match id {
            Some(id) => self.get(owner_id, &id).await,
            None => Ok(None),
        }
    }

    async fn list(
        &self,
        owner_id: &str,
        filter: &SessionFilter,
    ) -> Result<SessionPage, StoreError> {
        let rows: Vec<Row> = {
            let inner = self.inner.lock().expect("store mutex poisoned");
            inner
                .creation_order
                .iter()
                .filter_map(|id| inner.rows.get(id).cloned())
                .collect()
        };

        let mut matches = Vec::new();
        for row in rows {
            let session = row.lock().await;
            if session.owner_id == owner_id && filter.matches(&session) {
                matches.push(session.clone());
            }
        }

        let total = matches.len() as u64;
        let limit = filter.effective_limit();
        let offset = filter.effective_offset();
        let items: Vec<PaymentSession> = matches
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect();
        let has_more = u64::from(offset) + (items.len() as u64) < total;

        Ok(SessionPage {
            items,
            limit,
            offset,
            total,
            has_more,
        })
    }

    async fn lock_for_update(
        &self,
        owner_id: &str,
        id: &str,
    ) -> Result<Option<Box<dyn SessionTxn>>, StoreError> {
        let Some(row) = self.row(id) else {
            return Ok(None);
        };
        let guard = row.clone().lock_owned().await;
        if guard.owner_id != owner_id {
            return Ok(None);
        }
        Ok(Some(Box::new(InMemoryTxn { guard })))
    }
}

struct InMemoryTxn {
    guard: OwnedMutexGuard<PaymentSession>,
}

#[async_trait]
impl SessionTxn for InMemoryTxn {
    fn session(&self) -> &PaymentSession {
        &self.guard
    }

    async fn commit(mut self: Box<Self>, updated: PaymentSession) -> Result<(), StoreError> {
        *self.guard = updated;
        Ok(())
    }
}
