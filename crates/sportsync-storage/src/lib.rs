//! Rate-limited HTTP fetching and the SQLite result store for sportsync.

pub mod fetch;
pub mod store;

pub use fetch::{
    classify_status, BackoffPolicy, FetchError, FetchRequest, FetchResponse, HttpClientConfig,
    RateLimitedClient, ReqwestTransport, RetryDisposition, Transport,
};
pub use store::{ResultStore, StoreError, StoredRecord, StoredResult};
