use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Url;
use sportsync_core::{Record, RecordType};
use sportsync_storage::{BackoffPolicy, FetchRequest, RateLimitedClient, RetryDisposition};
use tracing::{debug, warn};

use crate::parse::{excerpt, RecordParser};
use crate::{AdapterContext, CollectionError, SourceAdapter};

/// Where a source lives and which endpoint serves each record type.
///
/// Endpoint templates may contain `{param}` placeholders filled from the job's
/// params; params not consumed by a placeholder are appended as query pairs.
/// Absolute templates ignore `base_url`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSource {
    pub source_id: String,
    pub base_url: String,
    pub endpoints: BTreeMap<RecordType, String>,
}

impl FeedSource {
    pub fn endpoint_url(
        &self,
        record_type: RecordType,
        params: &BTreeMap<String, String>,
    ) -> Result<String, CollectionError> {
        let template =
            self.endpoints
                .get(&record_type)
                .ok_or_else(|| CollectionError::UnsupportedRecordType {
                    source_id: self.source_id.clone(),
                    record_type,
                })?;

        let mut path = template.clone();
        let mut consumed = BTreeSet::new();
        for (key, value) in params {
            let placeholder = format!("{{{key}}}");
            if path.contains(&placeholder) {
                path = path.replace(&placeholder, value);
                consumed.insert(key.as_str());
            }
        }

        let invalid = |message: String, url: &str| CollectionError::InvalidEndpoint {
            source_id: self.source_id.clone(),
            url: url.to_string(),
            message,
        };
        if path.contains('{') {
            return Err(invalid("unresolved placeholder".to_string(), &path));
        }

        let joined = if path.starts_with("http://") || path.starts_with("https://") {
            path
        } else {
            format!(
                "{}/{}",
                self.base_url.trim_end_matches('/'),
                path.trim_start_matches('/')
            )
        };
        let mut url = Url::parse(&joined).map_err(|e| invalid(e.to_string(), &joined))?;

        let leftover: Vec<_> = params
            .iter()
            .filter(|(key, _)| !consumed.contains(key.as_str()))
            .collect();
        if !leftover.is_empty() {
            let mut query = url.query_pairs_mut();
            for (key, value) in leftover {
                query.append_pair(key, value);
            }
        }
        Ok(url.into())
    }
}

/// Fetches a source endpoint through the rate-limited client and hands the
/// body to a parser, retrying transient failures with exponential backoff.
pub struct FeedAdapter {
    source: FeedSource,
    client: Arc<RateLimitedClient>,
    parser: Arc<dyn RecordParser>,
    backoff: BackoffPolicy,
}

impl std::fmt::Debug for FeedAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedAdapter")
            .field("source", &self.source)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl FeedAdapter {
    pub fn new(
        source: FeedSource,
        client: Arc<RateLimitedClient>,
        parser: Arc<dyn RecordParser>,
    ) -> Self {
        Self {
            source,
            client,
            parser,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn source(&self) -> &FeedSource {
        &self.source
    }
}

#[async_trait]
impl SourceAdapter for FeedAdapter {
    fn source_id(&self) -> &str {
        &self.source.source_id
    }

    async fn collect(
        &self,
        ctx: &AdapterContext,
        record_type: RecordType,
    ) -> Result<Vec<Record>, CollectionError> {
        let source_id = self.source.source_id.as_str();
        let request = FetchRequest::get(self.source.endpoint_url(record_type, &ctx.params)?);
        let attempts = self.backoff.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.backoff.delay_for_attempt(attempt - 1);
                debug!(source_id, attempt, ?delay, "backing off before retry");
                tokio::time::sleep(delay).await;
            }

            match self.client.fetch(ctx.run_id, source_id, &request).await {
                Ok(response) => {
                    let records = self
                        .parser
                        .parse(record_type, &response.body)
                        .map_err(|e| CollectionError::StructuralParse {
                            source_id: source_id.to_string(),
                            message: e.message,
                            excerpt: excerpt(&response.body),
                        })?;
                    debug!(source_id, %record_type, count = records.len(), "parsed records");
                    return Ok(records);
                }
                Err(err) if err.disposition() == RetryDisposition::Retryable => {
                    warn!(source_id, attempt = attempt + 1, attempts, error = %err, "transient fetch failure");
                    last_error = err.to_string();
                }
                Err(err) => {
                    return Err(CollectionError::Permanent {
                        source_id: source_id.to_string(),
                        message: err.to_string(),
                    });
                }
            }
        }

        Err(CollectionError::RetriesExhausted {
            source_id: source_id.to_string(),
            attempts,
            last_error,
        })
    }
}
