//! Search API stage.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{client_for, DEFAULT_USER_AGENT};
use crate::executor::{StageExecutor, StageInput, StageKind, StageOutput};
use crate::proxy::ProxyRecord;
use crate::result::CandidateLink;
use crate::{PipelineError, Result};

/// Credentials for one search API quota.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKey {
    pub key: String,
    pub engine_id: String,
}

impl ApiKey {
    pub fn new(key: impl Into<String>, engine_id: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            engine_id: engine_id.into(),
        }
    }
}

/// Calls a Custom Search style JSON API and returns the result links.
///
/// Each round requests the next page of results, so a second round with
/// `page_size` 10 starts at result 11. With several keys, a key that is
/// rate limited or otherwise fails is rotated out, so the retry uses the
/// next one.
pub struct SearchApiCaller {
    endpoint: String,
    keys: Vec<ApiKey>,
    current: AtomicUsize,
    page_size: u32,
    user_agent: String,
}

impl SearchApiCaller {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        engine_id: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            keys: vec![ApiKey::new(api_key, engine_id)],
            current: AtomicUsize::new(0),
            page_size: 10,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }

    /// Creates a caller that spreads requests over several keys, starting
    /// with the first.
    pub fn with_keys(endpoint: impl Into<String>, keys: Vec<ApiKey>) -> Result<Self> {
        if keys.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "at least one search API key is required".to_string(),
            ));
        }
        Ok(Self {
            endpoint: endpoint.into(),
            keys,
            current: AtomicUsize::new(0),
            page_size: 10,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        })
    }

    /// Starts at a random key, so several processes sharing a key list do
    /// not all drain the same quota first.
    pub fn with_random_start(self) -> Self {
        let start = rand::thread_rng().gen_range(0..self.keys.len());
        self.current.store(start, Ordering::Relaxed);
        self
    }

    /// Sets the number of results per page (1 to 10).
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.clamp(1, 10);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    fn offset(&self, round: u32) -> u32 {
        round.saturating_sub(1) * self.page_size
    }

    /// Index of the key the next request uses.
    fn key_index(&self) -> usize {
        self.current.load(Ordering::Relaxed) % self.keys.len()
    }

    /// Moves past the key at `used`, unless a concurrent request already
    /// did.
    fn rotate_from(&self, used: usize) {
        if self.keys.len() < 2 {
            return;
        }
        let current = self.current.load(Ordering::Relaxed);
        if current % self.keys.len() == used {
            let _ = self.current.compare_exchange(
                current,
                (used + 1) % self.keys.len(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
        }
    }

    fn request_url(&self, key: &ApiKey, sentence: &str, round: u32) -> String {
        let separator = if self.endpoint.contains('?') { '&' } else { '?' };
        format!(
            "{}{}key={}&cx={}&q={}&start={}&num={}",
            self.endpoint,
            separator,
            urlencoding::encode(&key.key),
            urlencoding::encode(&key.engine_id),
            urlencoding::encode(sentence),
            self.offset(round) + 1,
            self.page_size
        )
    }
}

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    items: Vec<ApiItem>,
}

#[derive(Deserialize)]
struct ApiItem {
    #[serde(default)]
    link: String,
    #[serde(default)]
    title: String,
}

/// Parses an API response body. Items without an http(s) link are dropped.
fn parse_response(body: &str, offset: u32) -> Result<Vec<CandidateLink>> {
    let response: ApiResponse = serde_json::from_str(body)?;
    let candidates = response
        .items
        .into_iter()
        .filter(|item| item.link.starts_with("http://") || item.link.starts_with("https://"))
        .enumerate()
        .map(|(i, item)| CandidateLink::new(item.link, item.title, offset + i as u32 + 1))
        .collect();
    Ok(candidates)
}

async fn fetch_candidates(
    client: &reqwest::Client,
    url: &str,
    offset: u32,
) -> Result<Vec<CandidateLink>> {
    let response = client.get(url).send().await?.error_for_status()?;
    let body = response.text().await?;
    parse_response(&body, offset)
}

#[async_trait]
impl StageExecutor for SearchApiCaller {
    fn kind(&self) -> StageKind {
        StageKind::ApiCaller
    }

    async fn execute(
        &self,
        input: &StageInput,
        proxy: Option<&ProxyRecord>,
        deadline: Instant,
    ) -> Result<StageOutput> {
        let StageInput::Query { sentence, round } = input else {
            return Err(PipelineError::Unexpected(
                "search API caller expects a query".into(),
            ));
        };

        let client = client_for(proxy, deadline, &self.user_agent, None)?;
        let used = self.key_index();
        let url = self.request_url(&self.keys[used], sentence, *round);
        let result = fetch_candidates(&client, &url, self.offset(*round)).await;

        match result {
            Ok(candidates) => {
                debug!("Search API returned {} links for round {}", candidates.len(), round);
                Ok(StageOutput::Candidates(candidates))
            }
            Err(err) => {
                if self.keys.len() > 1 {
                    warn!("Search API key {} failed ({}), rotating", used + 1, err);
                }
                self.rotate_from(used);
                Err(err)
            }
        }
    }
}
