//! Field extractors for scraped detail pages.

use std::collections::BTreeMap;

use harvest_core::{text_or_none, Contact, Coordinates, ScrapedPage};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::AdapterError;

/// CSS selectors for one site's detail pages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorSet {
    pub ready: String,
    pub consent_button: Option<String>,
    pub title: String,
    pub price: String,
    pub address: String,
    pub city: String,
    pub zip_code: String,
    pub description: String,
    /// Rows rendered as `label : value`.
    pub attributes: String,
    pub features: String,
    pub images: String,
    pub contact_name: String,
    pub contact_phone: String,
    pub contact_email: String,
    pub energy_rating: String,
    pub event_date: String,
    /// Element carrying coordinates in `data-lat` / `data-lng`.
    pub geo: String,
    pub external_id: Option<String>,
    pub external_id_attribute: String,
    /// Fallback on the URL; the last match of group 1 wins.
    pub external_id_pattern: String,
}

impl Default for SelectorSet {
    fn default() -> Self {
        Self::listing()
    }
}

impl SelectorSet {
    pub fn listing() -> Self {
        Self {
            ready: "h1".into(),
            consent_button: Some("#didomi-notice-agree-button".into()),
            title: "h1".into(),
            price: ".price".into(),
            address: ".address".into(),
            city: ".city".into(),
            zip_code: ".zip-code".into(),
            description: ".description".into(),
            attributes: ".attributes li".into(),
            features: ".features li".into(),
            images: ".gallery img".into(),
            contact_name: ".contact .name".into(),
            contact_phone: ".contact .phone".into(),
            contact_email: ".contact .email".into(),
            energy_rating: ".energy-rating".into(),
            event_date: ".published-at".into(),
            geo: "[data-lat][data-lng]".into(),
            external_id: Some("[data-listing-id]".into()),
            external_id_attribute: "data-listing-id".into(),
            external_id_pattern: r"(\d{4,})".into(),
        }
    }

    pub fn auction() -> Self {
        Self {
            ready: ".lot-title".into(),
            consent_button: Some("#tarteaucitronPersonalize2".into()),
            title: ".lot-title".into(),
            price: ".starting-price".into(),
            address: ".lot-address".into(),
            city: ".lot-city".into(),
            zip_code: ".lot-zip".into(),
            description: ".lot-description".into(),
            attributes: ".lot-details li".into(),
            features: ".lot-features li".into(),
            images: ".lot-photos img".into(),
            contact_name: ".lawyer .name".into(),
            contact_phone: ".lawyer .phone".into(),
            contact_email: ".lawyer .email".into(),
            energy_rating: ".dpe".into(),
            event_date: ".sale-date".into(),
            geo: "[data-lat][data-lng]".into(),
            external_id: Some("[data-lot-id]".into()),
            external_id_attribute: "data-lot-id".into(),
            external_id_pattern: r"(\d{3,})".into(),
        }
    }
}

pub trait DetailExtractor: Send + Sync {
    fn extract(&self, url: &str, html: &str) -> ScrapedPage;
}

struct Compiled {
    title: Selector,
    price: Selector,
    address: Selector,
    city: Selector,
    zip_code: Selector,
    description: Selector,
    attributes: Selector,
    features: Selector,
    images: Selector,
    contact_name: Selector,
    contact_phone: Selector,
    contact_email: Selector,
    energy_rating: Selector,
    event_date: Selector,
    geo: Selector,
    external_id: Option<Selector>,
}

/// Runs one independent extractor per field; a missing field stays `None`.
pub struct SelectorExtractor {
    selectors: SelectorSet,
    compiled: Compiled,
    id_pattern: Regex,
}

fn compile(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|_| AdapterError::Selector(selector.to_string()))
}

impl SelectorExtractor {
    pub fn new(selectors: SelectorSet) -> Result<Self, AdapterError> {
        let compiled = Compiled {
            title: compile(&selectors.title)?,
            price: compile(&selectors.price)?,
            address: compile(&selectors.address)?,
            city: compile(&selectors.city)?,
            zip_code: compile(&selectors.zip_code)?,
            description: compile(&selectors.description)?,
            attributes: compile(&selectors.attributes)?,
            features: compile(&selectors.features)?,
            images: compile(&selectors.images)?,
            contact_name: compile(&selectors.contact_name)?,
            contact_phone: compile(&selectors.contact_phone)?,
            contact_email: compile(&selectors.contact_email)?,
            energy_rating: compile(&selectors.energy_rating)?,
            event_date: compile(&selectors.event_date)?,
            geo: compile(&selectors.geo)?,
            external_id: selectors.external_id.as_deref().map(compile).transpose()?,
        };
        let id_pattern = Regex::new(&selectors.external_id_pattern)?;
        Ok(Self {
            selectors,
            compiled,
            id_pattern,
        })
    }

    pub fn selectors(&self) -> &SelectorSet {
        &self.selectors
    }

    fn external_id(&self, document: &Html, url: &str) -> Option<String> {
        let from_page = self.compiled.external_id.as_ref().and_then(|sel| {
            document
                .select(sel)
                .next()
                .and_then(|node| node.value().attr(&self.selectors.external_id_attribute))
                .and_then(text_or_none)
        });
        from_page.or_else(|| {
            self.id_pattern
                .captures_iter(url)
                .last()
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_string())
        })
    }
}

fn node_text(node: ElementRef<'_>) -> Option<String> {
    text_or_none(&node.text().collect::<String>())
}

fn select_first_text(document: &Html, selector: &Selector) -> Option<String> {
    document.select(selector).next().and_then(node_text)
}

fn select_all_texts(document: &Html, selector: &Selector) -> Vec<String> {
    document.select(selector).filter_map(node_text).collect()
}

fn present<T>(url: &str, field: &'static str, value: Option<T>) -> Option<T> {
    if value.is_none() {
        debug!(url, field, "field not found on detail page");
    }
    value
}

/// First number in `text`, tolerating French digit grouping (`245 000 €`, `1.250.000`).
pub fn parse_price(text: &str) -> Option<f64> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let mut digits = String::new();
    let mut separators = Vec::new();
    for ch in text[start..].chars() {
        match ch {
            '0'..='9' => digits.push(ch),
            ',' | '.' => separators.push(digits.len()),
            ' ' | '\u{a0}' | '\u{202f}' => {}
            _ => break,
        }
    }
    let decimal_at = match separators.as_slice() {
        [] => None,
        [only] if digits.len() - *only == 3 => None,
        [.., last] if separators.len() > 1 && digits.len() - *last == 3 => None,
        [.., last] => Some(*last),
    };
    let number = match decimal_at {
        Some(at) if at < digits.len() => format!("{}.{}", &digits[..at], &digits[at..]),
        _ => digits,
    };
    number.parse().ok()
}

fn attribute_rows(document: &Html, selector: &Selector) -> BTreeMap<String, String> {
    select_all_texts(document, selector)
        .into_iter()
        .filter_map(|row| {
            let (key, value) = row.split_once(':')?;
            Some((text_or_none(key)?, text_or_none(value)?))
        })
        .collect()
}

fn image_sources(document: &Html, selector: &Selector) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for node in document.select(selector) {
        let src = node
            .value()
            .attr("data-src")
            .or_else(|| node.value().attr("src"))
            .and_then(text_or_none);
        if let Some(src) = src {
            if !out.contains(&src) {
                out.push(src);
            }
        }
    }
    out
}

fn geo_attributes(document: &Html, selector: &Selector) -> Option<Coordinates> {
    let node = document.select(selector).next()?;
    let lat = node.value().attr("data-lat")?.trim().parse().ok()?;
    let lng = node.value().attr("data-lng")?.trim().parse().ok()?;
    let coords = Coordinates::new(lat, lng);
    coords.is_valid().then_some(coords)
}

fn event_date(document: &Html, selector: &Selector) -> Option<String> {
    let node = document.select(selector).next()?;
    node.value()
        .attr("datetime")
        .and_then(text_or_none)
        .or_else(|| node_text(node))
}

impl DetailExtractor for SelectorExtractor {
    fn extract(&self, url: &str, html: &str) -> ScrapedPage {
        let document = Html::parse_document(html);
        let c = &self.compiled;

        let contact = Contact {
            name: select_first_text(&document, &c.contact_name),
            phone: select_first_text(&document, &c.contact_phone),
            email: select_first_text(&document, &c.contact_email),
        };

        ScrapedPage {
            url: url.to_string(),
            external_id: present(url, "external_id", self.external_id(&document, url)),
            title: present(url, "title", select_first_text(&document, &c.title)),
            price: present(
                url,
                "price",
                select_first_text(&document, &c.price).as_deref().and_then(parse_price),
            ),
            address: present(url, "address", select_first_text(&document, &c.address)),
            city: present(url, "city", select_first_text(&document, &c.city)),
            zip_code: present(url, "zip_code", select_first_text(&document, &c.zip_code)),
            description: present(url, "description", select_first_text(&document, &c.description)),
            attributes: attribute_rows(&document, &c.attributes),
            features: select_all_texts(&document, &c.features),
            images: image_sources(&document, &c.images),
            contact: present(url, "contact", (!contact.is_empty()).then_some(contact)),
            energy_rating: present(
                url,
                "energy_rating",
                select_first_text(&document, &c.energy_rating),
            ),
            event_date: event_date(&document, &c.event_date),
            coordinates: geo_attributes(&document, &c.geo),
        }
    }
}
