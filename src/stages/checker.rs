//! Proxy checks over plain HTTP.

use async_trait::async_trait;
use tokio::time::Instant;

use super::{client_for, DEFAULT_USER_AGENT};
use crate::proxy::{ProxyChecker, ProxyRecord};
use crate::{PipelineError, Result};

const DEFAULT_CHECK_URL: &str = "https://httpbin.org/ip";

/// Fetches a known URL through the proxy and expects a success status
/// and, optionally, a marker in the body.
pub struct HttpProxyChecker {
    url: String,
    expected: Option<String>,
    user_agent: String,
}

impl HttpProxyChecker {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            expected: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }

    /// Requires the response body to contain `text`.
    pub fn with_expected_text(mut self, text: impl Into<String>) -> Self {
        self.expected = Some(text.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
}

impl Default for HttpProxyChecker {
    /// Asks httpbin for the caller's address.
    fn default() -> Self {
        Self::new(DEFAULT_CHECK_URL).with_expected_text("origin")
    }
}

#[async_trait]
impl ProxyChecker for HttpProxyChecker {
    async fn check(&self, proxy: &ProxyRecord, deadline: Instant) -> Result<()> {
        let client = client_for(Some(proxy), deadline, &self.user_agent, None)?;
        let response = client.get(&self.url).send().await?.error_for_status()?;
        if let Some(expected) = &self.expected {
            let body = response.text().await?;
            if !body.contains(expected.as_str()) {
                return Err(PipelineError::Protocol(format!(
                    "check response from {} lacks {:?}",
                    self.url, expected
                )));
            }
        }
        Ok(())
    }
}
