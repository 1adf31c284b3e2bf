//! Browser-driver seam + selector-based extraction from rendered pages.

use std::collections::HashSet;

use async_trait::async_trait;
use rcd_core::{DetailFields, ListingSummary};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "rcd-extract";

/// Listing cards on a search results page.
pub const CARD_SELECTOR: &str = ".certification-card";
/// Fallback when a page variant renders cards under a different class.
pub const CARD_FALLBACK_SELECTOR: &str = "[class*=\"contractor\"]";
/// Enabled next-page control; absent on the final page.
pub const NEXT_PAGE_SELECTOR: &str = ".pagination__next:not([disabled])";

const PROFILE_LINK_SELECTOR: &str = "a[href*=\"/roofing-contractors/\"]";
const CITY_SELECTOR: &str = ".certification-card__city";
const ABOUT_SELECTOR: &str = ".about-section__content, [class*=\"about\"]";
const REVIEW_QUOTE_SELECTOR: &str = "span.contractor-reviews__quote-text";
const REVIEW_DATE_SELECTOR: &str = "div.contractor-reviews__date";
const DATA_LAYER_SELECTOR: &str = "[data-layer]";
const DETAILS_SELECTOR: &str = "div[class*=\"details\"], div[class*=\"info\"], \
     div[class*=\"contractor\"], div[class*=\"profile\"], div[class*=\"company\"]";

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("element not found: {0}")]
    ElementNotFound(String),
    #[error("driver error: {0}")]
    Other(String),
}

/// The external page-rendering engine. Implementations wrap a real headless
/// browser; tests script one from canned HTML. Every call may fail.
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Navigate to `url` and wait for the page to load.
    async fn goto(&self, url: &str) -> Result<(), DriverError>;

    /// Reload the current page.
    async fn reload(&self) -> Result<(), DriverError>;

    /// Snapshot of the rendered DOM.
    async fn content(&self) -> Result<String, DriverError>;

    /// Click the first element matching `selector` and wait for the
    /// resulting transition.
    async fn click(&self, selector: &str) -> Result<(), DriverError>;

    /// Whether any element currently matches `selector`.
    async fn exists(&self, selector: &str) -> Result<bool, DriverError>;

    /// Change fingerprint of the current page: the `article:modified_time`
    /// meta tag when present, otherwise the document's own last-modified
    /// value. `None` when the page exposes neither.
    async fn last_modified(&self) -> Result<Option<String>, DriverError>;
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid selector {selector}: {message}")]
    Selector { selector: String, message: String },
}

fn parse_selector(selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|e| ExtractError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Non-empty text fragments of an element, one entry per rendered text node.
fn text_lines(element: ElementRef<'_>) -> Vec<String> {
    element
        .text()
        .filter_map(|t| text_or_none(t.to_string()))
        .collect()
}

fn select_first_text(element: ElementRef<'_>, selector: &str) -> Result<Option<String>, ExtractError> {
    let sel = parse_selector(selector)?;
    Ok(element
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>())))
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// First matching element's attribute in a standalone HTML document.
pub fn select_first_attr_in(
    html: &str,
    selector: &str,
    attr: &str,
) -> Result<Option<String>, ExtractError> {
    let document = Html::parse_document(html);
    let sel = parse_selector(selector)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string())))
}

/// Whether any element matches `selector` in a standalone HTML document.
pub fn element_exists_in(html: &str, selector: &str) -> Result<bool, ExtractError> {
    let document = Html::parse_document(html);
    let sel = parse_selector(selector)?;
    Ok(document.select(&sel).next().is_some())
}

/// The contractor id is the trailing segment of the profile URL.
pub fn contractor_id_from_url(profile_url: &str) -> String {
    profile_url
        .rsplit('-')
        .next()
        .unwrap_or(profile_url)
        .to_string()
}

/// Parse listing cards out of a rendered search-results page.
///
/// Pagination chrome ("Showing ...") is skipped, and cards without a profile
/// link are discarded since no contractor id can be derived for them.
pub fn parse_listing_cards(html: &str) -> Result<Vec<ListingSummary>, ExtractError> {
    let document = Html::parse_document(html);
    let card_sel = parse_selector(CARD_SELECTOR)?;
    let mut cards: Vec<ElementRef<'_>> = document.select(&card_sel).collect();
    if cards.is_empty() {
        let fallback = parse_selector(CARD_FALLBACK_SELECTOR)?;
        cards = document.select(&fallback).collect();
    }

    let profile_sel = parse_selector(PROFILE_LINK_SELECTOR)?;
    let city_sel = parse_selector(CITY_SELECTOR)?;
    let phone_re = Regex::new(r"\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4}").expect("phone regex");

    let mut summaries = Vec::new();
    for card in cards {
        let lines = text_lines(card);
        if lines.first().map(|l| l.starts_with("Showing")).unwrap_or(false) {
            continue;
        }

        let Some(profile_url) = card
            .select(&profile_sel)
            .next()
            .and_then(|link| link.value().attr("href"))
            .map(ToString::to_string)
        else {
            continue;
        };

        let location = card
            .select(&city_sel)
            .next()
            .and_then(|n| text_or_none(n.text().collect::<String>()))
            // Strip the trailing distance, e.g. "New York, NY - 19.9 mi".
            .map(|loc| loc.split(" - ").next().unwrap_or(loc.as_str()).trim().to_string());

        let full_text = lines.join("\n");
        summaries.push(ListingSummary {
            profile_url,
            name: lines.first().cloned(),
            rating: lines.get(1).cloned(),
            location,
            phone: phone_re.find(&full_text).map(|m| m.as_str().to_string()),
        });
    }
    Ok(summaries)
}

/// Extract detail fields from a rendered profile page.
///
/// Best-effort per field: each extractor runs independently and a failure
/// leaves only that field empty.
pub fn extract_detail_fields(html: &str) -> DetailFields {
    let document = Html::parse_document(html);
    let mut detail = DetailFields::default();

    match select_first_text(document.root_element(), ABOUT_SELECTOR) {
        Ok(about) => detail.about = about,
        Err(err) => warn!(error = %err, "about extraction failed"),
    }

    match extract_reviews(&document) {
        Ok(reviews) => detail.reviews = reviews,
        Err(err) => warn!(error = %err, "review extraction failed"),
    }

    if let Err(err) = extract_data_layer_fields(&document, &mut detail) {
        warn!(error = %err, "data-layer extraction failed");
    }
    if let Err(err) = extract_labelled_details(&document, &mut detail) {
        warn!(error = %err, "contractor details extraction failed");
    }

    detail
}

fn extract_reviews(document: &Html) -> Result<Vec<String>, ExtractError> {
    let quote_sel = parse_selector(REVIEW_QUOTE_SELECTOR)?;
    let date_sel = parse_selector(REVIEW_DATE_SELECTOR)?;

    let mut reviews = Vec::new();
    let mut seen = HashSet::new();
    for element in document.select(&quote_sel) {
        let text = collapse_whitespace(&element.text().collect::<String>());
        if text.len() > 10 && seen.insert(text.clone()) {
            reviews.push(text);
        }
    }

    let dates: Vec<String> = document
        .select(&date_sel)
        .filter_map(|n| text_or_none(n.text().collect::<String>()))
        .collect();
    if dates.len() == reviews.len() {
        reviews = reviews
            .into_iter()
            .zip(dates)
            .map(|(review, date)| format!("{review} ({date})"))
            .collect();
    }
    Ok(reviews)
}

/// Employee counts sometimes ride along in `data-layer` JSON attributes
/// before they appear anywhere in visible text.
fn extract_data_layer_fields(document: &Html, detail: &mut DetailFields) -> Result<(), ExtractError> {
    let sel = parse_selector(DATA_LAYER_SELECTOR)?;
    for element in document.select(&sel) {
        let Some(raw) = element.value().attr("data-layer") else {
            continue;
        };
        let Ok(mut value) = serde_json::from_str::<serde_json::Value>(raw) else {
            continue;
        };
        if let Some(first) = value.as_array().and_then(|a| a.first()).cloned() {
            value = first;
        }
        if detail.number_of_employees.is_none() {
            if let Some(count) = value
                .get("event_attributes")
                .and_then(|attrs| attrs.get("number_of_employees"))
            {
                detail.number_of_employees = match count {
                    serde_json::Value::String(s) => text_or_none(s.clone()),
                    other => Some(other.to_string()),
                };
            }
        }
    }
    Ok(())
}

fn extract_labelled_details(document: &Html, detail: &mut DetailFields) -> Result<(), ExtractError> {
    let sel = parse_selector(DETAILS_SELECTOR)?;
    let year_re = Regex::new(
        r"(?:business since|in business since|established|founded)[:\s]*(\d{4})",
    )
    .expect("year regex");
    let license_re = Regex::new(
        r"(?:license|lic\.|license number|state license)[:\s]*([a-z0-9-]+(?:\s*[a-z0-9-]+)*)",
    )
    .expect("license regex");
    let employees_re = Regex::new(
        r"(?:employees|team size|staff size|company size|team members)[:\s]*(.+?)(?:\n|$)",
    )
    .expect("employees regex");

    for element in document.select(&sel) {
        let text = text_lines(element).join("\n").to_lowercase();

        if detail.founding_year.is_none() {
            if let Some(caps) = year_re.captures(&text) {
                detail.founding_year = Some(caps[1].to_string());
            }
        }

        if detail.state_license.is_none() {
            if let Some(caps) = license_re.captures(&text) {
                let candidate = caps[1].trim().to_string();
                if !matches!(candidate.as_str(), "number" | "license") {
                    let cleaned = collapse_whitespace(&candidate.replace("number", ""));
                    if !cleaned.is_empty() {
                        detail.state_license = Some(cleaned);
                    }
                }
            }
        }

        if detail.number_of_employees.is_none() {
            if let Some(caps) = employees_re.captures(&text) {
                let candidate = caps[1].trim().to_string();
                if !candidate.is_empty() && !matches!(candidate.as_str(), "number" | "size") {
                    detail.number_of_employees = Some(candidate);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contractor_id_is_trailing_url_segment() {
        assert_eq!(
            contractor_id_from_url("https://example.com/roofing-contractors/acme-roofing-10432"),
            "10432"
        );
        assert_eq!(contractor_id_from_url("nodashes"), "nodashes");
    }

    #[test]
    fn whitespace_collapses_inside_review_text() {
        assert_eq!(collapse_whitespace("  great \n  crew  "), "great crew");
    }

    #[test]
    fn invalid_selector_reports_which_one() {
        let err = parse_selector(":::").expect_err("must fail");
        let ExtractError::Selector { selector, .. } = err;
        assert_eq!(selector, ":::");
    }
}
