//! HTTP page scraper using reqwest.

use async_trait::async_trait;
use reqwest::Response;
use tokio::time::Instant;
use tracing::debug;

use super::{client_for, request_error, DEFAULT_USER_AGENT};
use crate::domain::DomainFilter;
use crate::executor::{StageExecutor, StageInput, StageKind, StageOutput};
use crate::proxy::ProxyRecord;
use crate::result::ScrapedPage;
use crate::{PipelineError, Result};

const DEFAULT_MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Fetches one page per attempt through the attempt's proxy.
///
/// Rate limiting and server errors are network failures, so the attempt
/// is retried through another proxy. Other error statuses describe the
/// page, not the proxy, and come back as a page without content. A
/// redirect into a blocked domain fails the attempt as a blocked domain.
pub struct HttpScraper {
    user_agent: String,
    max_body_bytes: usize,
    filter: DomainFilter,
}

impl HttpScraper {
    pub fn new() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            filter: DomainFilter::default(),
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Bodies are cut to this many bytes.
    pub fn with_max_body_bytes(mut self, max: usize) -> Self {
        self.max_body_bytes = max;
        self
    }

    /// Sets the domains redirects may not lead into.
    pub fn with_domain_filter(mut self, filter: DomainFilter) -> Self {
        self.filter = filter;
        self
    }
}

impl Default for HttpScraper {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads at most `max` bytes of the body. The rest is never downloaded.
async fn read_capped(mut response: Response, max: usize) -> Result<String> {
    let mut body = Vec::with_capacity(max.min(64 * 1024));
    while let Some(chunk) = response.chunk().await? {
        let room = max - body.len();
        if chunk.len() >= room {
            body.extend_from_slice(&chunk[..room]);
            debug!("Body of {} cut at {} bytes", response.url(), max);
            break;
        }
        body.extend_from_slice(&chunk);
    }
    Ok(decode_body(body))
}

/// Decodes a body as UTF-8. A character cut in half at the end is dropped;
/// other invalid bytes are replaced.
fn decode_body(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(err) if err.utf8_error().error_len().is_none() => {
            let valid = err.utf8_error().valid_up_to();
            let mut bytes = err.into_bytes();
            bytes.truncate(valid);
            String::from_utf8_lossy(&bytes).into_owned()
        }
        Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
    }
}

#[async_trait]
impl StageExecutor for HttpScraper {
    fn kind(&self) -> StageKind {
        StageKind::Scraper
    }

    async fn execute(
        &self,
        input: &StageInput,
        proxy: Option<&ProxyRecord>,
        deadline: Instant,
    ) -> Result<StageOutput> {
        let StageInput::Page { url } = input else {
            return Err(PipelineError::Unexpected("scraper expects a page URL".into()));
        };

        let client = client_for(proxy, deadline, &self.user_agent, Some(&self.filter))?;
        let response = client
            .get(url.as_str())
            .send()
            .await
            .map_err(request_error)?;
        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(PipelineError::Network(format!("HTTP {} from {}", status, url)));
        }

        let body = if status.is_success() {
            read_capped(response, self.max_body_bytes).await?
        } else {
            String::new()
        };

        let mut page = ScrapedPage::new(url.clone(), status.as_u16(), body);
        if let Some(proxy) = proxy {
            page = page.with_proxy(proxy.id);
        }
        Ok(StageOutput::Page(page))
    }
}
