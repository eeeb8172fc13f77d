//! Default stage executors: a search API caller, an HTTP scraper and a
//! regex link extractor, plus an HTTP proxy checker.

mod api_caller;
mod checker;
mod parser;
mod scraper;
#[cfg(test)]
mod test_server;

pub use api_caller::{ApiKey, SearchApiCaller};
pub use checker::HttpProxyChecker;
pub use parser::LinkExtractor;
pub use scraper::HttpScraper;

use reqwest::redirect::Policy;
use reqwest::{Client, Proxy as ReqwestProxy};
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use crate::config::PipelineConfig;
use crate::domain::DomainFilter;
use crate::proxy::ProxyRecord;
use crate::run::Stages;
use crate::{PipelineError, Result};

pub(crate) const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (compatible; mailmine-scrape/0.1)";

const MAX_REDIRECTS: usize = 10;

/// Builds the default HTTP stages around a search API caller. The scraper
/// refuses redirects into the configured blocked domains.
pub fn http_stages(api_caller: SearchApiCaller, config: &PipelineConfig) -> Stages {
    let scraper =
        HttpScraper::new().with_domain_filter(DomainFilter::new(&config.blocked_domains));
    Stages::new(api_caller, scraper, LinkExtractor::new())
}

#[derive(Debug, Error)]
#[error("redirect into blocked domain: {0}")]
struct BlockedRedirect(String);

/// Follows up to ten redirects, refusing any hop that lands in a blocked
/// domain.
fn redirect_policy(filter: DomainFilter) -> Policy {
    Policy::custom(move |attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error(format!("more than {} redirects", MAX_REDIRECTS));
        }
        if filter.is_blocked(attempt.url().as_str()) {
            let target = attempt.url().to_string();
            return attempt.error(BlockedRedirect(target));
        }
        attempt.follow()
    })
}

/// Maps a failed request, turning a refused redirect into
/// [`PipelineError::BlockedDomain`].
pub(crate) fn request_error(err: reqwest::Error) -> PipelineError {
    let mut source = std::error::Error::source(&err);
    while let Some(cause) = source {
        if let Some(blocked) = cause.downcast_ref::<BlockedRedirect>() {
            return PipelineError::BlockedDomain(blocked.0.clone());
        }
        source = cause.source();
    }
    PipelineError::Http(err)
}

/// Creates a client that egresses through `proxy` and gives up at
/// `deadline`. With a `filter`, redirects into blocked domains fail.
pub(crate) fn client_for(
    proxy: Option<&ProxyRecord>,
    deadline: Instant,
    user_agent: &str,
    filter: Option<&DomainFilter>,
) -> Result<Client> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Err(PipelineError::Timeout);
    }

    let mut builder = Client::builder()
        .user_agent(user_agent)
        .timeout(remaining)
        .connect_timeout(remaining);

    if let Some(proxy) = proxy {
        let proxy_url = proxy.egress_url()?;
        debug!("Using proxy: {}", proxy.display_name());
        let proxy = ReqwestProxy::all(&proxy_url)
            .map_err(|e| PipelineError::InvalidProxy(format!("Failed to create proxy: {}", e)))?;
        builder = builder.proxy(proxy);
    } else {
        builder = builder.no_proxy();
    }
    if let Some(filter) = filter {
        builder = builder.redirect(redirect_policy(filter.clone()));
    }

    builder
        .build()
        .map_err(|e| PipelineError::Unexpected(format!("Failed to create HTTP client: {}", e)))
}
