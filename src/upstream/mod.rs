//! Access to the upstream social-network API
//!
//! # Components
//!
//! - [`client`]: HTTP client speaking the method and `execute` protocol
//! - [`retry`]: Retry manager waiting out rate limits
//! - [`fetcher`]: Batched paginated reads of large collections
//!
//! # Example
//!
//! ```ignore
//! use member_sync::upstream::{BatchedFetcher, GroupMembers, HttpApiClient, RetryManager};
//!
//! let api = Arc::new(HttpApiClient::new(&config.upstream, &token)?);
//! let fetcher = BatchedFetcher::new(api, RetryManager::new(config.retry), 25, metrics);
//! let members = fetcher
//!     .fetch_all(GroupMembers { group_id: 42, page_size: 1000 }, None)
//!     .await?;
//! ```

pub mod client;
pub mod fetcher;
pub mod retry;

pub use client::{ApiCall, HttpApiClient, HttpConnector, UpstreamApi, UpstreamConnector};
pub use fetcher::{
    Batch, BatchCursor, BatchedFetcher, GroupMembers, Page, PagedCollection, UserProfiles,
};
pub use retry::RetryManager;
