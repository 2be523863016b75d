//! Configuration-driven HTML price source.
//!
//! Each [`HtmlSource`] is built from one `[[sources]]` config block: a search
//! URL template plus CSS selectors for the result container and the three
//! values. A session is a cookie-keeping HTTP client, optionally warmed up by
//! fetching `session_url` (login, store picker) before the first search.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, StatusCode};
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, instrument, warn};

use pricewatch_shared::{
    KEY_PLACEHOLDER, LookupStatus, PricewatchError, Result, SourceConfig, SourceName,
    SourceResult,
};

use crate::capability::{LookupError, LookupSession, SessionFactory};

/// User-Agent string for lookup requests.
const USER_AGENT: &str = concat!("pricewatch/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Extraction rules
// ---------------------------------------------------------------------------

/// Validated selectors and templates for one source.
#[derive(Debug)]
struct SourceRules {
    search_url: String,
    session_url: Option<String>,
    result_selector: Option<String>,
    primary_selector: String,
    secondary_selector: Option<String>,
    auxiliary_selector: Option<String>,
    not_found_selector: Option<String>,
    value_pattern: Option<Regex>,
}

impl SourceRules {
    fn from_config(config: &SourceConfig) -> Result<Self> {
        let selectors = [
            Some(&config.primary_selector),
            config.result_selector.as_ref(),
            config.secondary_selector.as_ref(),
            config.auxiliary_selector.as_ref(),
            config.not_found_selector.as_ref(),
        ];
        for selector in selectors.into_iter().flatten() {
            parse_selector(selector).map_err(|e| {
                PricewatchError::parse(format!("source '{}': {e}", config.name))
            })?;
        }

        let value_pattern = config
            .value_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| {
                PricewatchError::config(format!(
                    "source '{}': invalid value_pattern: {e}",
                    config.name
                ))
            })?;

        Ok(Self {
            search_url: config.search_url.clone(),
            session_url: config.session_url.clone(),
            result_selector: config.result_selector.clone(),
            primary_selector: config.primary_selector.clone(),
            secondary_selector: config.secondary_selector.clone(),
            auxiliary_selector: config.auxiliary_selector.clone(),
            not_found_selector: config.not_found_selector.clone(),
            value_pattern,
        })
    }

    /// Search URL for one item key (the key is query-encoded).
    fn search_url_for(&self, key: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(key.as_bytes()).collect();
        self.search_url.replace(KEY_PLACEHOLDER, &encoded)
    }

    /// Pull the three values out of a search result page.
    fn extract(&self, body: &str) -> std::result::Result<SourceResult, LookupError> {
        let doc = Html::parse_document(body);

        if let Some(sel) = &self.not_found_selector {
            let sel = parse_selector(sel).map_err(LookupError::Failed)?;
            if doc.select(&sel).next().is_some() {
                return Err(LookupError::NotFound);
            }
        }

        let container = match &self.result_selector {
            Some(sel) => {
                let sel = parse_selector(sel).map_err(LookupError::Failed)?;
                doc.select(&sel).next()
            }
            None => Some(doc.root_element()),
        };
        let Some(container) = container else {
            return Err(LookupError::NotFound);
        };

        let primary = self.value(container, Some(&self.primary_selector))?;
        let secondary = self.value(container, self.secondary_selector.as_ref())?;
        let auxiliary = self.value(container, self.auxiliary_selector.as_ref())?;

        if primary.is_empty() && secondary.is_empty() {
            return Err(LookupError::NotFound);
        }

        Ok(SourceResult::found(primary, secondary, auxiliary))
    }

    fn value(
        &self,
        container: ElementRef<'_>,
        selector: Option<&String>,
    ) -> std::result::Result<String, LookupError> {
        let Some(selector) = selector else {
            return Ok(String::new());
        };
        let sel = parse_selector(selector).map_err(LookupError::Failed)?;
        let text = container
            .select(&sel)
            .next()
            .map(|el| collapse_whitespace(&el.text().collect::<String>()))
            .unwrap_or_default();

        Ok(match &self.value_pattern {
            Some(re) => re
                .find(&text)
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
            None => text,
        })
    }
}

fn parse_selector(selector: &str) -> std::result::Result<Selector, String> {
    Selector::parse(selector).map_err(|e| format!("invalid selector '{selector}': {e:?}"))
}

/// Join runs of whitespace (including newlines) into single spaces.
fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ---------------------------------------------------------------------------
// HtmlSource (factory)
// ---------------------------------------------------------------------------

/// A price source scraped from HTML search pages.
pub struct HtmlSource {
    name: SourceName,
    rules: Arc<SourceRules>,
    timeout_status: LookupStatus,
    request_timeout: Duration,
}

impl std::fmt::Debug for HtmlSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HtmlSource")
            .field("name", &self.name)
            .field("search_url", &self.rules.search_url)
            .finish_non_exhaustive()
    }
}

impl HtmlSource {
    /// Build a source from its config block. Selectors are validated here so
    /// a typo fails the run setup instead of every lookup.
    pub fn from_config(config: &SourceConfig, request_timeout: Duration) -> Result<Self> {
        Ok(Self {
            name: config.source_name(),
            rules: Arc::new(SourceRules::from_config(config)?),
            timeout_status: config.timeout_status.into(),
            request_timeout,
        })
    }

    fn build_client(&self) -> std::result::Result<Client, LookupError> {
        Client::builder()
            .user_agent(USER_AGENT)
            .cookie_store(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| LookupError::Acquire(format!("failed to build HTTP client: {e}")))
    }
}

#[async_trait]
impl SessionFactory for HtmlSource {
    fn source(&self) -> &SourceName {
        &self.name
    }

    #[instrument(skip_all, fields(source = %self.name))]
    async fn acquire(&self) -> std::result::Result<Box<dyn LookupSession>, LookupError> {
        let client = self.build_client()?;

        if let Some(session_url) = &self.rules.session_url {
            debug!(%session_url, "warming up session");
            let response = client
                .get(session_url)
                .send()
                .await
                .map_err(|e| LookupError::Acquire(format!("{session_url}: {e}")))?;
            if !response.status().is_success() {
                return Err(LookupError::Acquire(format!(
                    "{session_url}: HTTP {}",
                    response.status()
                )));
            }
        }

        Ok(Box::new(HtmlSession {
            client,
            rules: self.rules.clone(),
        }))
    }

    fn timeout_status(&self) -> LookupStatus {
        self.timeout_status
    }
}

// ---------------------------------------------------------------------------
// HtmlSession
// ---------------------------------------------------------------------------

/// A cookie-keeping HTTP client bound to one source.
struct HtmlSession {
    client: Client,
    rules: Arc<SourceRules>,
}

#[async_trait]
impl LookupSession for HtmlSession {
    async fn lookup(&mut self, key: &str) -> std::result::Result<SourceResult, LookupError> {
        let url = self.rules.search_url_for(key);
        debug!(%url, "searching");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| classify_send_error(&url, e))?;

        let status = response.status();
        match status {
            StatusCode::NOT_FOUND => return Err(LookupError::NotFound),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                warn!(%url, %status, "session rejected by source");
                return Err(LookupError::SessionDied(format!("{url}: HTTP {status}")));
            }
            s if !s.is_success() => {
                return Err(LookupError::Failed(format!("{url}: HTTP {status}")));
            }
            _ => {}
        }

        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                LookupError::TimedOut(format!("{url}: {e}"))
            } else {
                LookupError::Failed(format!("{url}: body read failed: {e}"))
            }
        })?;

        self.rules.extract(&body)
    }
}

/// A refused connection means the session's endpoint is gone; a timeout
/// follows the source's timeout policy; anything else is charged to the
/// current item.
fn classify_send_error(url: &str, e: reqwest::Error) -> LookupError {
    if e.is_timeout() {
        LookupError::TimedOut(format!("{url}: {e}"))
    } else if e.is_connect() {
        LookupError::SessionDied(format!("{url}: {e}"))
    } else {
        LookupError::Failed(format!("{url}: {e}"))
    }
}
