//! Link extraction from scraped pages.

use std::collections::HashSet;

use async_trait::async_trait;
use regex::Regex;
use tokio::time::Instant;
use url::Url;

use crate::domain::DomainFilter;
use crate::executor::{StageExecutor, StageInput, StageKind, StageOutput};
use crate::proxy::ProxyRecord;
use crate::result::{normalize_url, ScrapedPage};
use crate::{PipelineError, Result};

const HREF_PATTERN: &str = r#"(?i)href\s*=\s*["']([^"'\s]+)["']"#;
const ABSOLUTE_PATTERN: &str = r#"https?://[^\s"'<>()\[\]{}\\]+"#;

const ASSET_EXTENSIONS: &[&str] = &[
    ".css", ".js", ".png", ".jpg", ".jpeg", ".gif", ".svg", ".webp", ".ico", ".woff", ".woff2",
    ".ttf", ".mp4", ".mp3", ".pdf", ".zip",
];

/// Extracts outbound http(s) links from page bodies.
///
/// Relative `href` values are resolved against the page URL. Links to
/// blocked domains and static assets are dropped, and each link is
/// reported once per call.
pub struct LinkExtractor {
    href: Regex,
    absolute: Regex,
    filter: DomainFilter,
}

impl LinkExtractor {
    pub fn new() -> Self {
        Self {
            href: Regex::new(HREF_PATTERN).expect("valid href pattern"),
            absolute: Regex::new(ABSOLUTE_PATTERN).expect("valid link pattern"),
            filter: DomainFilter::default(),
        }
    }

    /// Replaces the domain filter applied to extracted links.
    pub fn with_filter(mut self, filter: DomainFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Extracts links from one page.
    pub fn extract(&self, page: &ScrapedPage) -> Vec<String> {
        if !page.has_content() {
            return Vec::new();
        }
        let base = Url::parse(&page.url).ok();

        let hrefs = self.href.captures_iter(&page.body).filter_map(|caps| {
            let raw = caps.get(1)?.as_str();
            match &base {
                Some(base) => base.join(raw).ok().map(String::from),
                None => Url::parse(raw).ok().map(String::from),
            }
        });
        let bare = self
            .absolute
            .find_iter(&page.body)
            .map(|m| m.as_str().to_string());

        let mut seen = HashSet::new();
        hrefs
            .chain(bare)
            .filter_map(|link| self.accept(link))
            .filter(|link| seen.insert(normalize_url(link)))
            .collect()
    }

    fn accept(&self, link: String) -> Option<String> {
        let link = link
            .trim_end_matches(|c| matches!(c, '.' | ',' | ';' | ':' | '!' | '?'))
            .to_string();
        let mut url = Url::parse(&link).ok()?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return None;
        }
        url.set_fragment(None);
        let path = url.path().to_lowercase();
        if ASSET_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
            return None;
        }
        let link = String::from(url);
        if self.filter.is_blocked(&link) {
            return None;
        }
        Some(link)
    }
}

impl Default for LinkExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StageExecutor for LinkExtractor {
    fn kind(&self) -> StageKind {
        StageKind::Parser
    }

    fn uses_proxy(&self) -> bool {
        false
    }

    async fn execute(
        &self,
        input: &StageInput,
        _proxy: Option<&ProxyRecord>,
        _deadline: Instant,
    ) -> Result<StageOutput> {
        let StageInput::Pages(pages) = input else {
            return Err(PipelineError::Unexpected("parser expects scraped pages".into()));
        };

        let mut seen = HashSet::new();
        let links = pages
            .iter()
            .flat_map(|page| self.extract(page))
            .filter(|link| seen.insert(normalize_url(link)))
            .collect();
        Ok(StageOutput::Links(links))
    }
}
