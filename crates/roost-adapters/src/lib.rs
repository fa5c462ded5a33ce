//! Item extraction contracts + page-source abstractions for roost.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use roost_core::{Record, Scope, TaskKind};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "roost-adapters";

/// One candidate element captured from the page, as raw markup. Parsed on
/// demand by extractors; opaque to everything upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawItem {
    pub html: String,
}

impl RawItem {
    pub fn new(html: impl Into<String>) -> Self {
        Self { html: html.into() }
    }
}

/// Provenance handed to extractors so records carry their origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeContext {
    pub task: TaskKind,
    pub target: String,
}

impl ScopeContext {
    pub fn for_scope(scope: &Scope) -> Self {
        Self {
            task: scope.task,
            target: scope.target.clone(),
        }
    }
}

/// Typed outcome of extracting one raw item. Callers can tell "not an item"
/// from "item, but broken" and treat each accordingly.
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    /// The element matched the expected shape and produced a record.
    Extracted(Record),
    /// The element is not an item of the expected shape at all.
    NoMatch,
    /// The element looked like an item but its required pieces were broken.
    Malformed(String),
}

pub trait ItemExtractor: Send + Sync {
    fn extract(&self, raw: &RawItem, ctx: &ScopeContext) -> Extraction;

    /// CSS selector identifying candidate items on the page.
    fn item_selector(&self) -> &'static str;
}

/// How much of an item to pull out. `Fast` keeps only the identifier,
/// `Full` adds every optional field the markup exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailLevel {
    Fast,
    Full,
}

/// A single way of pulling one value out of a fragment. Strategies are
/// tried in order; the first that yields a non-empty value wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// Attribute of the first element matching the selector.
    AttrOfFirst { selector: String, attr: String },
    /// Collected text of the first element matching the selector.
    TextOfFirst { selector: String },
    /// Text of the first matching element whose text starts with a prefix.
    TextWithPrefix { selector: String, prefix: String },
}

impl Strategy {
    pub fn attr_of_first(selector: impl Into<String>, attr: impl Into<String>) -> Self {
        Strategy::AttrOfFirst {
            selector: selector.into(),
            attr: attr.into(),
        }
    }

    pub fn text_of_first(selector: impl Into<String>) -> Self {
        Strategy::TextOfFirst {
            selector: selector.into(),
        }
    }

    pub fn text_with_prefix(selector: impl Into<String>, prefix: impl Into<String>) -> Self {
        Strategy::TextWithPrefix {
            selector: selector.into(),
            prefix: prefix.into(),
        }
    }

    pub fn apply(&self, doc: &Html) -> Option<String> {
        match self {
            Strategy::AttrOfFirst { selector, attr } => {
                let sel = Selector::parse(selector).ok()?;
                doc.select(&sel)
                    .next()
                    .and_then(|el| el.value().attr(attr))
                    .and_then(text_or_none)
            }
            Strategy::TextOfFirst { selector } => {
                let sel = Selector::parse(selector).ok()?;
                doc.select(&sel)
                    .next()
                    .and_then(|el| text_or_none(&el.text().collect::<String>()))
            }
            Strategy::TextWithPrefix { selector, prefix } => {
                let sel = Selector::parse(selector).ok()?;
                doc.select(&sel)
                    .filter_map(|el| text_or_none(&el.text().collect::<String>()))
                    .find(|t| t.starts_with(prefix.as_str()))
            }
        }
    }
}

/// Try strategies in order; first success short-circuits.
pub fn first_match(doc: &Html, strategies: &[Strategy]) -> Option<String> {
    strategies.iter().find_map(|s| s.apply(doc))
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn probe(doc: &Html, selector: &str) -> bool {
    Selector::parse(selector)
        .map(|sel| doc.select(&sel).next().is_some())
        .unwrap_or(false)
}

/// Handle from a profile-link href, rejecting non-profile links.
fn handle_from_profile_href(href: &str) -> Option<String> {
    for marker in ["/search", "/followers", "/following", "/status", "/i/"] {
        if href.contains(marker) {
            return None;
        }
    }
    let handle = href.trim_end_matches('/').rsplit('/').next()?.trim();
    if handle.is_empty() || handle.contains(['?', '=', '.', '#']) {
        return None;
    }
    Some(handle.trim_start_matches('@').to_string())
}

/// Extracts one user from a user-cell fragment: handle (required), plus
/// display name, bio, and verified badge at full detail.
#[derive(Debug, Clone, Copy)]
pub struct UserCellExtractor {
    detail: DetailLevel,
}

impl UserCellExtractor {
    pub fn new(detail: DetailLevel) -> Self {
        Self { detail }
    }

    fn handle(&self, doc: &Html) -> Option<String> {
        let from_anchor = Selector::parse("a[href]").ok().and_then(|sel| {
            doc.select(&sel)
                .filter_map(|el| el.value().attr("href"))
                .find_map(handle_from_profile_href)
        });
        from_anchor.or_else(|| {
            first_match(doc, &[Strategy::text_with_prefix("span", "@")])
                .and_then(|t| t.split_whitespace().next().map(str::to_string))
                .map(|t| t.trim_start_matches('@').to_string())
                .filter(|h| !h.is_empty())
        })
    }

    fn display_name(&self, doc: &Html) -> Option<String> {
        let sel = Selector::parse("span").ok()?;
        doc.select(&sel)
            .filter_map(|el| text_or_none(&el.text().collect::<String>()))
            .find(|t| !t.starts_with('@') && t != "Follow")
    }
}

impl ItemExtractor for UserCellExtractor {
    fn extract(&self, raw: &RawItem, ctx: &ScopeContext) -> Extraction {
        let doc = Html::parse_fragment(&raw.html);
        let Some(handle) = self.handle(&doc) else {
            return if probe(&doc, "a[href]") || probe(&doc, "span") {
                Extraction::Malformed("user cell without a usable profile handle".to_string())
            } else {
                Extraction::NoMatch
            };
        };

        let id = format!("@{handle}");
        let mut record = Record::new(id.clone(), ctx.task, &ctx.target, Utc::now())
            .with_attr("username", id);
        if self.detail == DetailLevel::Full {
            let display_name = self.display_name(&doc).unwrap_or_else(|| handle.clone());
            let bio = first_match(
                &doc,
                &[
                    Strategy::text_of_first("div[dir='auto']"),
                    Strategy::text_of_first(".bio"),
                ],
            )
            .unwrap_or_default();
            let verified = probe(&doc, "svg[data-testid='icon-verified']");
            record = record
                .with_attr("display_name", display_name)
                .with_attr("bio", bio)
                .with_attr("verified", verified.to_string());
        }
        Extraction::Extracted(record)
    }

    fn item_selector(&self) -> &'static str {
        "div[data-testid='UserCell']"
    }
}

/// Extracts one tweet from an article fragment: status id and permalink
/// (required), plus text, timestamp, and engagement counts at full detail.
#[derive(Debug, Clone, Copy)]
pub struct TweetExtractor {
    detail: DetailLevel,
}

impl TweetExtractor {
    pub fn new(detail: DetailLevel) -> Self {
        Self { detail }
    }

    fn permalink(&self, doc: &Html) -> Option<String> {
        let sel = Selector::parse("a[href]").ok()?;
        doc.select(&sel)
            .filter_map(|el| el.value().attr("href"))
            .find(|href| href.contains("/status/"))
            .map(str::to_string)
    }

    fn metric(&self, doc: &Html, name: &str) -> String {
        first_match(
            doc,
            &[Strategy::text_of_first(format!(
                "div[data-testid='{name}'] span"
            ))],
        )
        .unwrap_or_else(|| "0".to_string())
    }
}

fn tweet_id_from_url(url: &str) -> Option<String> {
    let id = url.split("/status/").nth(1)?.split(['?', '/']).next()?;
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

impl ItemExtractor for TweetExtractor {
    fn extract(&self, raw: &RawItem, ctx: &ScopeContext) -> Extraction {
        let doc = Html::parse_fragment(&raw.html);
        let Some(url) = self.permalink(&doc) else {
            return if probe(&doc, "article") {
                Extraction::Malformed("tweet article without a status permalink".to_string())
            } else {
                Extraction::NoMatch
            };
        };
        let Some(id) = tweet_id_from_url(&url) else {
            return Extraction::Malformed(format!("status permalink with an empty id: {url}"));
        };

        let mut record = Record::new(id, ctx.task, &ctx.target, Utc::now())
            .with_attr("tweet_url", url);
        if self.detail == DetailLevel::Full {
            let text = first_match(
                &doc,
                &[
                    Strategy::text_of_first("div[data-testid='tweetText']"),
                    Strategy::text_of_first(".tweet-text"),
                ],
            )
            .unwrap_or_default();
            let timestamp = first_match(&doc, &[Strategy::attr_of_first("time", "datetime")])
                .unwrap_or_default();
            record = record
                .with_attr("text", text)
                .with_attr("timestamp", timestamp)
                .with_attr("replies", self.metric(&doc, "reply"))
                .with_attr("retweets", self.metric(&doc, "retweet"))
                .with_attr("likes", self.metric(&doc, "like"));
        }
        Extraction::Extracted(record)
    }

    fn item_selector(&self) -> &'static str {
        "article[data-testid='tweet']"
    }
}

/// The extractor matching a task's item shape.
pub fn extractor_for_task(task: TaskKind, detail: DetailLevel) -> Box<dyn ItemExtractor> {
    if task.is_tweet_task() {
        Box::new(TweetExtractor::new(detail))
    } else {
        Box::new(UserCellExtractor::new(detail))
    }
}

#[derive(Debug, Error)]
pub enum PageError {
    #[error("navigation failed for {url}: {reason}")]
    Navigation { url: String, reason: String },
    #[error("content extension failed: {0}")]
    Extend(String),
}

/// The consumed page/source driver surface: navigate somewhere, read the
/// currently visible candidate items, and ask the source to reveal more.
#[async_trait]
pub trait PageSource: Send {
    async fn navigate(&mut self, url: &str) -> Result<(), PageError>;

    fn visible_items(&self, selector: &str) -> Vec<RawItem>;

    fn item_count(&self, selector: &str) -> usize {
        self.visible_items(selector).len()
    }

    /// Ask the source to reveal more content (scroll / next page).
    async fn extend(&mut self) -> Result<(), PageError>;
}

/// Serialized form of a scripted page, loadable from a JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct PageScript {
    pub items: Vec<String>,
    #[serde(default = "default_initial_visible")]
    pub initial_visible: usize,
    #[serde(default = "default_reveal_per_extend")]
    pub reveal_per_extend: usize,
}

fn default_initial_visible() -> usize {
    10
}

fn default_reveal_per_extend() -> usize {
    10
}

/// Fixture-backed page source: a fixed item list revealed a scripted number
/// at a time. Stands in for the real browser driver in tests and offline
/// runs, and can simulate empty pages, stalls, re-rendered overlap, and
/// navigation failure.
#[derive(Debug, Clone)]
pub struct ScriptedPageSource {
    items: Vec<RawItem>,
    visible: usize,
    initial_visible: usize,
    reveal_per_extend: usize,
    rerender_overlap: usize,
    fail_navigation: bool,
    navigated: bool,
}

impl ScriptedPageSource {
    pub fn new(items: Vec<RawItem>) -> Self {
        Self {
            items,
            visible: 0,
            initial_visible: default_initial_visible(),
            reveal_per_extend: default_reveal_per_extend(),
            rerender_overlap: 0,
            fail_navigation: false,
            navigated: false,
        }
    }

    pub fn with_initial_visible(mut self, count: usize) -> Self {
        self.initial_visible = count;
        self
    }

    pub fn with_reveal_per_extend(mut self, count: usize) -> Self {
        self.reveal_per_extend = count;
        self
    }

    /// Re-list the trailing `count` items on every read, the way a
    /// re-rendering page shows the same cells twice.
    pub fn with_rerender_overlap(mut self, count: usize) -> Self {
        self.rerender_overlap = count;
        self
    }

    pub fn failing_navigation(mut self) -> Self {
        self.fail_navigation = true;
        self
    }

    pub fn from_script_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading page script {}", path.display()))?;
        let script: PageScript = serde_json::from_str(&text)
            .with_context(|| format!("parsing page script {}", path.display()))?;
        Ok(Self::new(script.items.into_iter().map(RawItem::new).collect())
            .with_initial_visible(script.initial_visible)
            .with_reveal_per_extend(script.reveal_per_extend))
    }
}

#[async_trait]
impl PageSource for ScriptedPageSource {
    async fn navigate(&mut self, url: &str) -> Result<(), PageError> {
        if self.fail_navigation {
            return Err(PageError::Navigation {
                url: url.to_string(),
                reason: "scripted navigation failure".to_string(),
            });
        }
        self.navigated = true;
        self.visible = self.initial_visible.min(self.items.len());
        Ok(())
    }

    fn visible_items(&self, _selector: &str) -> Vec<RawItem> {
        if !self.navigated {
            return Vec::new();
        }
        let mut out = self.items[..self.visible].to_vec();
        if self.rerender_overlap > 0 && self.visible > 0 {
            let start = self.visible.saturating_sub(self.rerender_overlap);
            out.extend_from_slice(&self.items[start..self.visible]);
        }
        out
    }

    async fn extend(&mut self) -> Result<(), PageError> {
        self.visible = (self.visible + self.reveal_per_extend).min(self.items.len());
        Ok(())
    }
}

/// Canonical user-cell markup for scripted sources and tests.
pub fn user_cell_fixture(handle: &str, display_name: &str, bio: &str) -> RawItem {
    RawItem::new(format!(
        "<div data-testid=\"UserCell\"><a href=\"/{handle}\"><span>{display_name}</span></a>\
         <span>@{handle}</span><div dir=\"auto\">{bio}</div></div>"
    ))
}

/// Canonical tweet-article markup for scripted sources and tests.
pub fn tweet_fixture(id: &str, text: &str) -> RawItem {
    RawItem::new(format!(
        "<article data-testid=\"tweet\"><a href=\"/someone/status/{id}\">permalink</a>\
         <div data-testid=\"tweetText\">{text}</div>\
         <time datetime=\"2026-03-01T12:00:00Z\"></time>\
         <div data-testid=\"reply\"><span>1</span></div>\
         <div data-testid=\"retweet\"><span>2</span></div>\
         <div data-testid=\"like\"><span>3</span></div></article>"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ScopeContext {
        ScopeContext {
            task: TaskKind::Followers,
            target: "MindAIProject".to_string(),
        }
    }

    #[test]
    fn strategies_try_in_order_and_short_circuit() {
        let doc = Html::parse_fragment(
            "<div><a href=\"/apply\">Apply</a><span class=\"name\">First</span>\
             <span class=\"name\">Second</span></div>",
        );
        let value = first_match(
            &doc,
            &[
                Strategy::text_of_first(".missing"),
                Strategy::text_of_first(".name"),
                Strategy::attr_of_first("a", "href"),
            ],
        );
        assert_eq!(value.as_deref(), Some("First"));

        let href = first_match(&doc, &[Strategy::attr_of_first("a", "href")]);
        assert_eq!(href.as_deref(), Some("/apply"));

        assert!(first_match(&doc, &[Strategy::text_of_first(".missing")]).is_none());
    }

    #[test]
    fn user_cell_full_detail_extracts_every_field() {
        let extractor = UserCellExtractor::new(DetailLevel::Full);
        let raw = user_cell_fixture("byte_og", "Byte", "likes compilers");
        let Extraction::Extracted(record) = extractor.extract(&raw, &ctx()) else {
            panic!("expected extraction");
        };
        assert_eq!(record.id, "@byte_og");
        assert_eq!(record.attr("username"), Some("@byte_og"));
        assert_eq!(record.attr("display_name"), Some("Byte"));
        assert_eq!(record.attr("bio"), Some("likes compilers"));
        assert_eq!(record.attr("verified"), Some("false"));
        assert_eq!(record.source, "MindAIProject");
    }

    #[test]
    fn user_cell_fast_detail_keeps_only_the_handle() {
        let extractor = UserCellExtractor::new(DetailLevel::Fast);
        let raw = user_cell_fixture("byte_og", "Byte", "likes compilers");
        let Extraction::Extracted(record) = extractor.extract(&raw, &ctx()) else {
            panic!("expected extraction");
        };
        assert_eq!(record.id, "@byte_og");
        assert_eq!(record.attrs.len(), 1, "fast mode carries only the username");
    }

    #[test]
    fn user_cell_handle_falls_back_to_at_span() {
        let extractor = UserCellExtractor::new(DetailLevel::Fast);
        let raw = RawItem::new(
            "<div data-testid=\"UserCell\"><a href=\"/i/premium\">upsell</a>\
             <span>@fallback_user</span></div>",
        );
        let Extraction::Extracted(record) = extractor.extract(&raw, &ctx()) else {
            panic!("expected extraction");
        };
        assert_eq!(record.id, "@fallback_user");
    }

    #[test]
    fn user_cell_distinguishes_malformed_from_no_match() {
        let extractor = UserCellExtractor::new(DetailLevel::Full);
        let broken = RawItem::new("<div><span>Follow</span></div>");
        assert!(matches!(
            extractor.extract(&broken, &ctx()),
            Extraction::Malformed(_)
        ));

        let unrelated = RawItem::new("<hr>");
        assert_eq!(extractor.extract(&unrelated, &ctx()), Extraction::NoMatch);
    }

    #[test]
    fn tweet_extraction_reads_id_text_and_metrics() {
        let extractor = TweetExtractor::new(DetailLevel::Full);
        let raw = tweet_fixture("1234567890", "hello graph");
        let tweet_ctx = ScopeContext {
            task: TaskKind::Tweets,
            target: "MindAIProject".to_string(),
        };
        let Extraction::Extracted(record) = extractor.extract(&raw, &tweet_ctx) else {
            panic!("expected extraction");
        };
        assert_eq!(record.id, "1234567890");
        assert_eq!(record.attr("text"), Some("hello graph"));
        assert_eq!(record.attr("replies"), Some("1"));
        assert_eq!(record.attr("retweets"), Some("2"));
        assert_eq!(record.attr("likes"), Some("3"));
        assert_eq!(record.attr("timestamp"), Some("2026-03-01T12:00:00Z"));
    }

    #[test]
    fn tweet_without_permalink_is_malformed() {
        let extractor = TweetExtractor::new(DetailLevel::Full);
        let raw = RawItem::new("<article data-testid=\"tweet\"><span>deleted</span></article>");
        assert!(matches!(
            extractor.extract(&raw, &ctx()),
            Extraction::Malformed(_)
        ));
    }

    #[test]
    fn tweet_id_strips_query_strings() {
        assert_eq!(
            tweet_id_from_url("https://x.com/a/status/42?s=20").as_deref(),
            Some("42")
        );
        assert_eq!(
            tweet_id_from_url("/a/status/42/photo/1").as_deref(),
            Some("42")
        );
        assert!(tweet_id_from_url("/a/with/no/permalink").is_none());
    }

    #[tokio::test]
    async fn scripted_source_reveals_then_stalls() {
        let items: Vec<RawItem> = (1..=25)
            .map(|i| user_cell_fixture(&format!("u{i}"), &format!("User {i}"), ""))
            .collect();
        let mut page = ScriptedPageSource::new(items)
            .with_initial_visible(10)
            .with_reveal_per_extend(10);

        assert_eq!(page.item_count("div"), 0, "nothing visible before navigation");
        page.navigate("https://x.com/someone/followers").await.unwrap();
        assert_eq!(page.item_count("div"), 10);
        page.extend().await.unwrap();
        assert_eq!(page.item_count("div"), 20);
        page.extend().await.unwrap();
        page.extend().await.unwrap();
        assert_eq!(page.item_count("div"), 25, "extends past the end stall");
    }

    #[tokio::test]
    async fn scripted_source_overlap_duplicates_trailing_items() {
        let items: Vec<RawItem> = (1..=4)
            .map(|i| user_cell_fixture(&format!("u{i}"), "", ""))
            .collect();
        let mut page = ScriptedPageSource::new(items)
            .with_initial_visible(4)
            .with_rerender_overlap(2);
        page.navigate("https://x.com/someone/followers").await.unwrap();
        assert_eq!(page.visible_items("div").len(), 6);
    }

    #[tokio::test]
    async fn scripted_navigation_failure_surfaces_as_page_error() {
        let mut page = ScriptedPageSource::new(Vec::new()).failing_navigation();
        let err = page.navigate("https://x.com/gone").await.unwrap_err();
        assert!(matches!(err, PageError::Navigation { .. }));
    }
}
