//! Batched paginated fetching of large upstream collections
//!
//! A collection is read in pages of at most `page_ceiling` items, and up to
//! `max_calls_per_request` pages are combined into a single `execute`
//! request. Each physical request goes through the retry manager.

use crate::config::UpstreamConfig;
use crate::error::UpstreamError;
use crate::models::UserProfile;
use crate::otel::SyncMetrics;
use crate::upstream::client::{ApiCall, UpstreamApi};
use crate::upstream::retry::RetryManager;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// One parsed page
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    /// Collection size reported by the upstream, if it reports one
    pub total: Option<u64>,
    pub items: Vec<T>,
}

/// An upstream collection readable by offset and count
pub trait PagedCollection: Send + Sync {
    type Item: Send;

    /// Largest page the upstream serves for this collection
    fn page_ceiling(&self) -> u64;

    /// Call reading `count` items starting at `offset`
    fn page_call(&self, offset: u64, count: u64) -> ApiCall;

    /// Parse one sub-call result
    fn parse_page(&self, value: Value) -> Result<Page<Self::Item>, UpstreamError>;

    /// Size of the collection when it is known without asking
    fn known_len(&self) -> Option<u64> {
        None
    }
}

/// Member ids of a group, via `groups.getMembers`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMembers {
    pub group_id: i64,
    pub page_size: u64,
}

#[derive(Debug, Deserialize)]
struct MembersPage {
    count: u64,
    items: Vec<i64>,
}

impl PagedCollection for GroupMembers {
    type Item = i64;

    fn page_ceiling(&self) -> u64 {
        self.page_size
    }

    fn page_call(&self, offset: u64, count: u64) -> ApiCall {
        ApiCall::new("groups.getMembers")
            .param("group_id", self.group_id)
            .param("count", count)
            .param("offset", offset)
    }

    fn parse_page(&self, value: Value) -> Result<Page<i64>, UpstreamError> {
        let page: MembersPage = serde_json::from_value(value)
            .map_err(|e| UpstreamError::InvalidData(format!("groups.getMembers: {}", e)))?;
        Ok(Page {
            total: Some(page.count),
            items: page.items,
        })
    }
}

/// Profiles of a fixed list of users, via `users.get`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfiles {
    pub user_ids: Vec<i64>,
    pub fields: String,
    pub page_size: u64,
}

impl UserProfiles {
    /// Profiles of `user_ids` with the configured page size and fields
    pub fn from_config(config: &UpstreamConfig, user_ids: Vec<i64>) -> Self {
        Self {
            user_ids,
            fields: config.profile_fields.clone(),
            page_size: config.users_per_page,
        }
    }
}

impl PagedCollection for UserProfiles {
    type Item = UserProfile;

    fn page_ceiling(&self) -> u64 {
        self.page_size
    }

    fn page_call(&self, offset: u64, count: u64) -> ApiCall {
        let len = self.user_ids.len();
        let start = (offset as usize).min(len);
        let end = start.saturating_add(count as usize).min(len);
        let ids = self.user_ids[start..end]
            .iter()
            .map(i64::to_string)
            .collect::<Vec<_>>()
            .join(",");

        ApiCall::new("users.get")
            .param("user_ids", ids)
            .param("fields", self.fields.as_str())
    }

    fn parse_page(&self, value: Value) -> Result<Page<UserProfile>, UpstreamError> {
        let items: Vec<UserProfile> = serde_json::from_value(value)
            .map_err(|e| UpstreamError::InvalidData(format!("users.get: {}", e)))?;
        Ok(Page {
            total: self.known_len(),
            items,
        })
    }

    fn known_len(&self) -> Option<u64> {
        Some(self.user_ids.len() as u64)
    }
}

/// Items returned by one physical request
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<T> {
    pub items: Vec<T>,
    /// Total reported by the first page of the request
    pub total: Option<u64>,
}

/// Fetches collections through one upstream credential
#[derive(Clone)]
pub struct BatchedFetcher {
    api: Arc<dyn UpstreamApi>,
    retry: RetryManager,
    max_calls_per_request: usize,
    metrics: SyncMetrics,
}

impl BatchedFetcher {
    pub fn new(
        api: Arc<dyn UpstreamApi>,
        retry: RetryManager,
        max_calls_per_request: usize,
        metrics: SyncMetrics,
    ) -> Self {
        Self {
            api,
            retry,
            max_calls_per_request: max_calls_per_request.max(1),
            metrics,
        }
    }

    /// Start reading `collection`, stopping after `requested` items if given
    pub fn cursor<C: PagedCollection>(
        &self,
        collection: C,
        requested: Option<u64>,
    ) -> BatchCursor<'_, C> {
        let remaining = match (requested, collection.known_len()) {
            (Some(r), Some(len)) => Some(r.min(len)),
            (r, len) => r.or(len),
        };

        BatchCursor {
            fetcher: self,
            collection,
            offset: 0,
            remaining,
            done: false,
        }
    }

    /// Read a whole collection, or its first `requested` items
    pub async fn fetch_all<C: PagedCollection>(
        &self,
        collection: C,
        requested: Option<u64>,
    ) -> Result<Vec<C::Item>, UpstreamError> {
        let mut cursor = self.cursor(collection, requested);
        let mut items = Vec::new();
        while let Some(batch) = cursor.next_batch().await? {
            items.extend(batch.items);
        }
        Ok(items)
    }

    /// Member count of a group from a single one-item page
    pub async fn num_total_members(&self, group_id: i64) -> Result<u64, UpstreamError> {
        let collection = GroupMembers {
            group_id,
            page_size: 1,
        };
        let call = collection.page_call(0, 1);
        let api = self.api.clone();
        let metrics = self.metrics.clone();

        let value = self
            .retry
            .execute(|_| {
                let api = api.clone();
                let call = call.clone();
                metrics.record_upstream_request("groups.getMembers");
                async move { api.call(&call).await }
            })
            .await?;

        let page = collection.parse_page(value)?;
        Ok(page.total.unwrap_or(0))
    }

    async fn execute_batch(&self, calls: Vec<ApiCall>) -> Result<Vec<Value>, UpstreamError> {
        let api = self.api.clone();
        let metrics = self.metrics.clone();

        self.retry
            .execute(|_| {
                let api = api.clone();
                let calls = calls.clone();
                metrics.record_upstream_request("execute");
                async move { api.execute(&calls).await }
            })
            .await
    }
}

/// Position in a collection being read batch by batch
pub struct BatchCursor<'a, C: PagedCollection> {
    fetcher: &'a BatchedFetcher,
    collection: C,
    offset: u64,
    remaining: Option<u64>,
    done: bool,
}

impl<'a, C: PagedCollection> BatchCursor<'a, C> {
    /// Items consumed so far
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Fetch the next physical request's worth of items
    ///
    /// Returns `None` once the upstream returns nothing or the requested
    /// number of items has been read.
    pub async fn next_batch(&mut self) -> Result<Option<Batch<C::Item>>, UpstreamError> {
        if self.done {
            return Ok(None);
        }

        let page = self.collection.page_ceiling().max(1);
        let batch_ceiling = page * self.fetcher.max_calls_per_request as u64;
        let wanted = match self.remaining {
            Some(0) => {
                self.done = true;
                return Ok(None);
            }
            Some(remaining) => remaining.min(batch_ceiling),
            None => batch_ceiling,
        };

        let mut calls = Vec::new();
        let mut planned = 0;
        while planned < wanted {
            let count = page.min(wanted - planned);
            calls.push(self.collection.page_call(self.offset + planned, count));
            planned += count;
        }

        debug!(
            offset = self.offset,
            wanted = wanted,
            calls = calls.len(),
            "Fetching batch"
        );

        let results = self.fetcher.execute_batch(calls).await?;

        let mut total = None;
        let mut items = Vec::new();
        for result in results {
            let parsed = self.collection.parse_page(result)?;
            if total.is_none() {
                total = parsed.total;
            }
            items.extend(parsed.items);
        }

        if items.is_empty() {
            self.done = true;
            return Ok(None);
        }

        let received = items.len() as u64;
        self.offset += received;
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(received);
        }

        Ok(Some(Batch { items, total }))
    }
}
