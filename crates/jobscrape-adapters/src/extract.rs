//! Selector-driven listing extraction.

use jobscrape_core::{RawListing, SelectorConfig, UNSPECIFIED_LOCATION};
use scraper::{ElementRef, Html, Node, Selector};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid selector `{selector}`: {message}")]
    InvalidSelector { selector: String, message: String },
}

/// A source's selectors, parsed once before any page of that source is read.
#[derive(Debug, Clone)]
pub struct CompiledSelectors {
    job: Selector,
    title: Option<Selector>,
    location: Option<Selector>,
    date: Option<Selector>,
    link: Option<Selector>,
    next_sibling: bool,
    link_in_job: bool,
}

fn parse_selector(selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|e| ExtractError::InvalidSelector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn parse_optional(selector: Option<&str>) -> Result<Option<Selector>, ExtractError> {
    jobscrape_core::non_blank(selector).map(parse_selector).transpose()
}

impl CompiledSelectors {
    pub fn compile(config: &SelectorConfig) -> Result<Self, ExtractError> {
        Ok(Self {
            job: parse_selector(config.job_selector.trim())?,
            title: parse_optional(config.title_selector.as_deref())?,
            location: parse_optional(config.location_selector.as_deref())?,
            date: parse_optional(config.date_selector.as_deref())?,
            link: parse_optional(config.link_selector.as_deref())?,
            next_sibling: config.next_sibling,
            link_in_job: config.link_in_job_selector,
        })
    }
}

/// Text of `element`: each text node trimmed, blank nodes dropped, the rest joined with no separator.
pub fn stripped_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect()
}

fn sibling_text(element: ElementRef<'_>) -> Option<String> {
    let node = element.next_sibling()?;
    match node.value() {
        Node::Text(text) => Some(text.trim().to_string()),
        Node::Element(_) => ElementRef::wrap(node).map(stripped_text),
        _ => None,
    }
}

fn field_text(
    container: ElementRef<'_>,
    field: &'static str,
    selector: Option<&Selector>,
    next_sibling: bool,
) -> Option<String> {
    let Some(selector) = selector else {
        warn!(field, event = "MissingSelector", "no selector configured for field");
        return None;
    };
    let Some(found) = container.select(selector).next() else {
        debug!(field, event = "MissingSelector", "selector matched nothing in listing");
        return None;
    };
    if next_sibling {
        sibling_text(found)
    } else {
        Some(stripped_text(found))
    }
}

// `href` is kept byte-for-byte: it feeds the listing identity.
fn link_of(container: ElementRef<'_>, selectors: &CompiledSelectors) -> Option<String> {
    if selectors.link_in_job {
        return container.value().attr("href").map(str::to_string);
    }
    let Some(selector) = &selectors.link else {
        warn!(field = "link", event = "MissingSelector", "no selector configured for field");
        return None;
    };
    container
        .select(selector)
        .next()
        .and_then(|a| a.value().attr("href"))
        .map(str::to_string)
}

/// One record per element matched by the job selector, in document order.
pub fn extract(
    html: &str,
    selectors: &CompiledSelectors,
    category: Option<&str>,
    job_type: Option<&str>,
) -> Vec<RawListing> {
    let document = Html::parse_document(html);
    document
        .select(&selectors.job)
        .map(|container| {
            let location = field_text(
                container,
                "location",
                selectors.location.as_ref(),
                selectors.next_sibling,
            )
            .filter(|text| !text.trim().is_empty())
            .unwrap_or_else(|| UNSPECIFIED_LOCATION.to_string());

            RawListing {
                title: field_text(container, "title", selectors.title.as_ref(), false),
                location: Some(location),
                date_text: field_text(container, "date", selectors.date.as_ref(), false)
                    .filter(|text| !text.is_empty()),
                link: link_of(container, selectors),
                category: category.map(str::to_string),
                job_type: job_type.map(str::to_string),
            }
        })
        .collect()
}
