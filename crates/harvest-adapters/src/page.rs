use std::sync::Arc;

use async_trait::async_trait;
use harvest_core::{ExtractionMethod, RawEventRecord};
use harvest_storage::HttpFetcher;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;
use url::Url;

use crate::source::{SelectorMap, SourceConfig};
use crate::AdapterError;

/// Upper bound on page text handed to the AI collaborator.
pub const MAX_PAGE_TEXT_CHARS: usize = 24_000;

/// A loaded page. `url` is the final URL after redirects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageHandle {
    pub url: String,
    pub html: String,
}

impl PageHandle {
    pub fn new(url: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            html: html.into(),
        }
    }

    pub fn text(&self, max_chars: usize) -> String {
        clean_page_text(&self.html, max_chars)
    }
}

#[async_trait]
pub trait PageAutomation: Send + Sync {
    async fn navigate(&self, source_name: &str, url: &str) -> Result<PageHandle, AdapterError>;

    async fn extract_via_selectors(
        &self,
        page: &PageHandle,
        source: &SourceConfig,
    ) -> Result<Vec<RawEventRecord>, AdapterError>;
}

/// Plain HTTP page loading with `scraper` selector evaluation. No script execution.
#[derive(Debug, Clone)]
pub struct HttpPageAutomation {
    fetcher: Arc<HttpFetcher>,
}

impl HttpPageAutomation {
    pub fn new(fetcher: Arc<HttpFetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl PageAutomation for HttpPageAutomation {
    async fn navigate(&self, source_name: &str, url: &str) -> Result<PageHandle, AdapterError> {
        let response = self.fetcher.get(source_name, url).await?;
        Ok(PageHandle::new(response.final_url.clone(), response.text()))
    }

    async fn extract_via_selectors(
        &self,
        page: &PageHandle,
        source: &SourceConfig,
    ) -> Result<Vec<RawEventRecord>, AdapterError> {
        extract_with_selectors(&page.html, &page.url, source)
    }
}

struct CompiledSelectors {
    container: Selector,
    title: Selector,
    date: Option<Selector>,
    time: Option<Selector>,
    price: Option<Selector>,
    location: Option<Selector>,
    venue: Option<Selector>,
    description: Option<Selector>,
    link: Option<Selector>,
    category: Option<Selector>,
}

fn compile(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn compile_opt(selector: Option<&String>) -> Result<Option<Selector>, AdapterError> {
    selector.map(|s| compile(s)).transpose()
}

impl CompiledSelectors {
    fn new(map: &SelectorMap) -> Result<Self, AdapterError> {
        Ok(Self {
            container: compile(&map.event_container)?,
            title: compile(&map.title)?,
            date: compile_opt(map.date.as_ref())?,
            time: compile_opt(map.time.as_ref())?,
            price: compile_opt(map.price.as_ref())?,
            location: compile_opt(map.location.as_ref())?,
            venue: compile_opt(map.venue.as_ref())?,
            description: compile_opt(map.description.as_ref())?,
            link: compile_opt(map.link.as_ref())?,
            category: compile_opt(map.category.as_ref())?,
        })
    }
}

fn text_or_none(value: &str) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn first_text(scope: ElementRef<'_>, selector: Option<&Selector>) -> Option<String> {
    let element = scope.select(selector?).next()?;
    text_or_none(&element.text().collect::<String>())
        // <time datetime="..."> with an empty body.
        .or_else(|| element.value().attr("datetime").and_then(text_or_none))
}

fn link_href(scope: ElementRef<'_>, selector: Option<&Selector>) -> Option<String> {
    match selector {
        Some(selector) => scope
            .select(selector)
            .find_map(|el| el.value().attr("href"))
            .and_then(text_or_none),
        None => scope.value().attr("href").and_then(text_or_none),
    }
}

/// Resolves `href` against `base`; unresolvable links are kept as written.
pub fn resolve_link(base: Option<&Url>, href: &str) -> String {
    match base.and_then(|b| b.join(href).ok()) {
        Some(url) => url.to_string(),
        None => href.to_string(),
    }
}

/// Runs the source's selector map over `html`. Containers without a title are skipped.
pub fn extract_with_selectors(
    html: &str,
    page_url: &str,
    source: &SourceConfig,
) -> Result<Vec<RawEventRecord>, AdapterError> {
    let Some(map) = &source.selectors else {
        return Ok(Vec::new());
    };
    let selectors = CompiledSelectors::new(map)?;
    let base = Url::parse(page_url)
        .or_else(|_| Url::parse(&source.base_url))
        .ok();
    let document = Html::parse_document(html);

    let mut records = Vec::new();
    let mut skipped = 0usize;
    for container in document.select(&selectors.container) {
        let Some(title) = first_text(container, Some(&selectors.title)) else {
            skipped += 1;
            continue;
        };
        records.push(RawEventRecord {
            title,
            date_text: first_text(container, selectors.date.as_ref()),
            time_text: first_text(container, selectors.time.as_ref()),
            price_text: first_text(container, selectors.price.as_ref()),
            location_text: first_text(container, selectors.location.as_ref()),
            venue_text: first_text(container, selectors.venue.as_ref()),
            description_text: first_text(container, selectors.description.as_ref()),
            detail_url: link_href(container, selectors.link.as_ref())
                .map(|href| resolve_link(base.as_ref(), &href)),
            category_text: first_text(container, selectors.category.as_ref()),
            source_name: source.name.clone(),
            extraction_method: ExtractionMethod::CssSelector,
        });
    }

    debug!(
        source = %source.name,
        url = page_url,
        found = records.len(),
        skipped,
        "selector extraction"
    );
    Ok(records)
}

/// Visible page text: script, style and noscript bodies dropped, whitespace
/// collapsed, truncated to `max_chars`.
pub fn clean_page_text(html: &str, max_chars: usize) -> String {
    let document = Html::parse_document(html);
    let mut pieces = Vec::new();
    for node in document.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| {
            ancestor.value().as_element().is_some_and(|el| {
                matches!(el.name(), "script" | "style" | "noscript" | "template")
            })
        });
        if !hidden {
            pieces.extend(text.split_whitespace());
        }
    }
    pieces.join(" ").chars().take(max_chars).collect()
}
