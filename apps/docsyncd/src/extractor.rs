//! Baseline HTML extractor: fetches a page over HTTP and pulls out a
//! title and plain text with `scraper`. This is the daemon's bundled
//! default — a richer `Extractor` (real markdown conversion, JS
//! rendering, whatever a deployment needs) can be swapped in without
//! touching `docsync-cache`.

use std::time::Duration;

use async_trait::async_trait;
use docsync_cache::{Extractor, PageResult};
use docsync_shared::{CanonicalUrl, FetchError};
use scraper::{Html, Selector};

pub struct HtmlExtractor {
    client: reqwest::Client,
    timeout: Duration,
}

impl HtmlExtractor {
    pub fn new(user_agent: &str, timeout_secs: u64) -> Self {
        let timeout = Duration::from_secs(timeout_secs);
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .expect("failed to build extractor http client");
        Self { client, timeout }
    }
}

#[async_trait]
impl Extractor for HtmlExtractor {
    async fn fetch(&self, url: &CanonicalUrl) -> Result<PageResult, FetchError> {
        let response = self.client.get(url.as_str()).send().await.map_err(|e| {
            if e.is_timeout() { FetchError::Timeout(self.timeout) } else { FetchError::Connection(e.to_string()) }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !content_type.is_empty()
            && !content_type.contains("html")
            && !content_type.contains("xml")
            && !content_type.contains("text")
        {
            return Err(FetchError::UnsupportedContentType(content_type));
        }

        let body = response.text().await.map_err(|e| FetchError::Connection(e.to_string()))?;
        let document = Html::parse_document(&body);

        let title_selector = Selector::parse("title").expect("static selector");
        let title = document
            .select(&title_selector)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|s| !s.is_empty());

        let body_selector = Selector::parse("body").expect("static selector");
        let text = document
            .select(&body_selector)
            .next()
            .map(|el| normalize_whitespace(&el.text().collect::<Vec<_>>().join(" ")))
            .unwrap_or_default();

        if text.is_empty() {
            return Err(FetchError::ExtractionFailed("no extractable text content".to_string()));
        }

        let excerpt = Some(text.chars().take(280).collect::<String>());
        let markdown = match &title {
            Some(heading) => format!("# {heading}\n\n{text}"),
            None => text.clone(),
        };

        Ok(PageResult { title, markdown, text, excerpt })
    }
}

fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
