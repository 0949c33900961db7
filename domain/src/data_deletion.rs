//! Durable hand-off of provider data-deletion requests.
//!
//! Verifying a deletion webhook only records a work item and answers with its confirmation code;
//! the purge itself runs out of band and marks the item completed.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use connect_auth::oauth::ProviderKind;
use log::*;
use rand::Rng;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::Error;

/// Length in bytes of a confirmation code before hex encoding.
const CONFIRMATION_CODE_BYTES: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionStatus {
    Pending,
    Completed,
}

/// One provider request to purge an account's data.
///
/// Serializes to the public status view: the provider account and owner are never exposed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeletionRequest {
    pub confirmation_code: String,
    pub provider: ProviderKind,
    #[serde(skip_serializing)]
    pub account_id: String,
    #[serde(skip_serializing)]
    pub owner_ids: Vec<String>,
    pub requested_at: DateTime<Utc>,
    pub due_by: DateTime<Utc>,
    pub status: DeletionStatus,
}

/// Store of data-deletion work items.
#[async_trait]
pub trait DeletionQueue: Send + Sync {
    /// Record a deletion request due within `sla`.
    ///
    /// Idempotent per (provider, account) while the item is pending: a repeated request returns
    /// the existing item and its original confirmation code. Once completed, a new request opens
    /// a new item.
    async fn enqueue(
        &self,
        provider: ProviderKind,
        account_id: &str,
        owner_ids: Vec<String>,
        sla: Duration,
    ) -> Result<DeletionRequest, Error>;

    async fn get(&self, confirmation_code: &str) -> Result<Option<DeletionRequest>, Error>;

    /// Items not yet completed, oldest first.
    async fn pending(&self) -> Result<Vec<DeletionRequest>, Error>;

    /// Mark an item completed. Returns false for an unknown code.
    async fn complete(&self, confirmation_code: &str) -> Result<bool, Error>;
}

#[derive(Default)]
struct Queue {
    by_code: HashMap<String, DeletionRequest>,
    by_account: HashMap<(ProviderKind, String), String>,
}

/// Deletion queue kept in process memory.
#[derive(Clone, Default)]
pub struct MemoryDeletionQueue {
    inner: Arc<Mutex<Queue>>,
}

impl MemoryDeletionQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

fn confirmation_code() -> String {
    let bytes: [u8; CONFIRMATION_CODE_BYTES] = rand::thread_rng().gen();
    hex::encode(bytes)
}

#[async_trait]
impl DeletionQueue for MemoryDeletionQueue {
    async fn enqueue(
        &self,
        provider: ProviderKind,
        account_id: &str,
        owner_ids: Vec<String>,
        sla: Duration,
    ) -> Result<DeletionRequest, Error> {
        let mut queue = self.inner.lock().await;
        let key = (provider, account_id.to_string());

        if let Some(existing) = queue
            .by_account
            .get(&key)
            .and_then(|code| queue.by_code.get(code))
            .filter(|request| request.status == DeletionStatus::Pending)
        {
            debug!(
                "Deletion for {} account {} already queued",
                provider, account_id
            );
            return Ok(existing.clone());
        }

        let requested_at = Utc::now();
        let request = DeletionRequest {
            confirmation_code: confirmation_code(),
            provider,
            account_id: account_id.to_string(),
            owner_ids,
            requested_at,
            due_by: requested_at + sla,
            status: DeletionStatus::Pending,
        };

        queue
            .by_account
            .insert(key, request.confirmation_code.clone());
        queue
            .by_code
            .insert(request.confirmation_code.clone(), request.clone());

        info!(
            "Queued {} data deletion for account {} due by {}",
            provider, account_id, request.due_by
        );
        Ok(request)
    }

    async fn get(&self, confirmation_code: &str) -> Result<Option<DeletionRequest>, Error> {
        Ok(self.inner.lock().await.by_code.get(confirmation_code).cloned())
    }

    async fn pending(&self) -> Result<Vec<DeletionRequest>, Error> {
        let queue = self.inner.lock().await;
        let mut pending: Vec<DeletionRequest> = queue
            .by_code
            .values()
            .filter(|request| request.status == DeletionStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|request| request.requested_at);
        Ok(pending)
    }

    async fn complete(&self, confirmation_code: &str) -> Result<bool, Error> {
        let mut queue = self.inner.lock().await;
        match queue.by_code.get_mut(confirmation_code) {
            Some(request) => {
                request.status = DeletionStatus::Completed;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
