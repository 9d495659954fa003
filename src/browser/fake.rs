//! In-process stand-in for Chrome, serving static HTML per URL.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use scraper::{Html, Selector};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{LoadedPage, Session, SessionLauncher};
use crate::error::SessionError;
use crate::scraper::cleaner::squash_whitespace;

#[derive(Default)]
struct Counters {
    launched: AtomicUsize,
    live: AtomicUsize,
    abandoned: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct FakeBrowser {
    pages: Arc<HashMap<String, String>>,
    counters: Arc<Counters>,
    navigation_delay: Option<Duration>,
    fail_launch: bool,
}

impl FakeBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: &str, html: &str) -> Self {
        Arc::make_mut(&mut self.pages).insert(url.to_string(), html.to_string());
        self
    }

    /// Every navigation takes this long before the page appears.
    pub fn slow_navigation(mut self, delay: Duration) -> Self {
        self.navigation_delay = Some(delay);
        self
    }

    pub fn failing_launch(mut self) -> Self {
        self.fail_launch = true;
        self
    }

    pub fn launched_sessions(&self) -> usize {
        self.counters.launched.load(Ordering::SeqCst)
    }

    pub fn live_sessions(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }

    pub fn abandoned_sessions(&self) -> usize {
        self.counters.abandoned.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionLauncher for FakeBrowser {
    async fn acquire(&self) -> Result<Box<dyn Session>, SessionError> {
        if self.fail_launch {
            return Err(SessionError::Launch("no chrome binary".into()));
        }
        self.counters.launched.fetch_add(1, Ordering::SeqCst);
        self.counters.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            browser: self.clone(),
            open: true,
        }))
    }
}

struct FakeSession {
    browser: FakeBrowser,
    open: bool,
}

impl FakeSession {
    fn shut(&mut self) {
        if std::mem::take(&mut self.open) {
            self.browser.counters.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Session for FakeSession {
    async fn open(&self, url: &str) -> Result<Box<dyn LoadedPage>> {
        if let Some(delay) = self.browser.navigation_delay {
            tokio::time::sleep(delay).await;
        }
        let html = self
            .browser
            .pages
            .get(url)
            .ok_or_else(|| anyhow!("net::ERR_NAME_NOT_RESOLVED for {}", url))?;
        Ok(Box::new(FakePage { html: html.clone() }))
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        self.shut();
        Ok(())
    }

    fn abandon(&mut self) {
        if self.open {
            self.browser.counters.abandoned.fetch_add(1, Ordering::SeqCst);
        }
        self.shut();
    }
}

pub struct FakePage {
    pub html: String,
}

impl FakePage {
    pub fn new(html: &str) -> Self {
        Self { html: html.to_string() }
    }
}

fn first_text_in(html: &str, selectors: &str) -> Result<Option<String>> {
    let selector = Selector::parse(selectors).map_err(|e| anyhow!("bad selector: {:?}", e))?;
    let doc = Html::parse_document(html);
    Ok(doc
        .select(&selector)
        .map(|el| squash_whitespace(&el.text().collect::<Vec<_>>().join(" ")))
        .find(|t| !t.is_empty()))
}

fn price_like_in(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let span = Selector::parse("span").ok()?;
    doc.select(&span)
        .filter_map(|el| {
            let text = squash_whitespace(&el.text().collect::<Vec<_>>().join(" "));
            let class = el.value().attr("class").unwrap_or("").to_lowercase();
            let looks_priced = text.chars().any(|c| "₦$€£₹".contains(c))
                || class.contains("price")
                || class.contains("prc");
            (!text.is_empty() && looks_priced).then_some(text)
        })
        .next()
}

#[async_trait]
impl LoadedPage for FakePage {
    async fn first_text(&self, selectors: &str) -> Result<Option<String>> {
        first_text_in(&self.html, selectors)
    }

    async fn price_like_text(&self) -> Result<Option<String>> {
        Ok(price_like_in(&self.html))
    }

    async fn html(&self) -> Result<String> {
        Ok(self.html.clone())
    }
}
