//! Turn a raw listing into [`ArticleCandidate`]s.
//!
//! Handles RSS 2.0 (`channel/item`), RSS 1.0/RDF (top-level `item`) and Atom
//! (`entry`). Extraction is pure: no I/O, no clock.
//!
//! Every `<item>`/`<entry>` block is deserialized on its own, so a broken block
//! drops only itself. Before parsing, stray `&` and HTML-only entities are
//! escaped, and text fields carrying inline markup are wrapped in CDATA; the
//! HTML is then resolved by [`strip_html`]. Only a document without any item
//! block that is not well-formed XML is reported as unparseable.
//!
//! # Field Fallbacks
//!
//! | Field | Taken from |
//! |-------|------------|
//! | title | `title` (HTML stripped); empty drops the item |
//! | url | Atom `link@href` (alternate first), RSS `link`, then a URL-shaped `guid` |
//! | description | `description`, `summary`, `content:encoded`, `content`, then the title |
//! | published_at | `pubDate`, `dc:date`, `published`, `updated` (RFC 2822 / RFC 3339) |
//! | image_url | `media:thumbnail`, image `enclosure`, first `<img>` in the description |

use crate::errors::ExtractWarning;
use crate::models::{ArticleCandidate, Source};
use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use scraper::{Html, Selector};
use serde::Deserialize;
use std::borrow::Cow;
use tracing::{debug, instrument, warn};
use url::Url;

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static IMG: Lazy<Selector> = Lazy::new(|| Selector::parse("img[src]").unwrap());
static ITEM_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<(?:item|entry)(?:\s[^>]*)?>.*?</(?:item|entry)>").unwrap());
static CDATA: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!\[CDATA\[.*?\]\]>").unwrap());
static AMPERSAND: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&(#[0-9]+;|#[xX][0-9A-Fa-f]+;|[A-Za-z][A-Za-z0-9]*;)?").unwrap());
static MARKUP_FIELDS: Lazy<Vec<Regex>> = Lazy::new(|| {
    ["title", "description", "summary", "content:encoded", "content"]
        .iter()
        .map(|name| Regex::new(&format!(r"(?s)<({name})(\s[^>]*)?>(.*?)</{name}>")).unwrap())
        .collect()
});

/// Root element of a listing; only checks that the document is well-formed.
#[derive(Debug, Deserialize)]
struct FeedShell {}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TextNode {
    #[serde(rename = "$text")]
    text: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LinkNode {
    #[serde(rename = "@href")]
    href: Option<String>,
    #[serde(rename = "@rel")]
    rel: Option<String>,
    #[serde(rename = "$text")]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MediaNode {
    #[serde(rename = "@url")]
    url: Option<String>,
    #[serde(rename = "@type")]
    kind: Option<String>,
}

/// Union of the RSS item and Atom entry shapes. Repeatable fields are lists so
/// a stray duplicate element never fails the whole document.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawItem {
    title: Vec<TextNode>,
    link: Vec<LinkNode>,
    guid: Vec<TextNode>,
    description: Vec<TextNode>,
    summary: Vec<TextNode>,
    #[serde(rename = "encoded", alias = "content:encoded")]
    encoded: Vec<TextNode>,
    content: Vec<TextNode>,
    #[serde(rename = "pubDate")]
    pub_date: Vec<TextNode>,
    #[serde(rename = "date", alias = "dc:date")]
    dc_date: Vec<TextNode>,
    published: Vec<TextNode>,
    updated: Vec<TextNode>,
    #[serde(rename = "thumbnail", alias = "media:thumbnail")]
    thumbnail: Vec<MediaNode>,
    enclosure: Vec<MediaNode>,
}

fn first_text(nodes: &[TextNode]) -> Option<&str> {
    nodes
        .iter()
        .map(|n| n.text.trim())
        .find(|t| !t.is_empty())
}

/// Result of extracting one listing.
#[derive(Debug, Default)]
pub struct Extraction {
    pub candidates: Vec<ArticleCandidate>,
    /// Items skipped as malformed or for missing title or link.
    pub dropped: usize,
    pub warning: Option<ExtractWarning>,
}

/// Collapse runs of whitespace and trim.
pub fn normalize_whitespace(s: &str) -> String {
    WHITESPACE.replace_all(s.trim(), " ").into_owned()
}

/// Plain text of an HTML fragment.
pub fn strip_html(fragment: &str) -> String {
    if !fragment.contains(['<', '&']) {
        return normalize_whitespace(fragment);
    }
    let html = Html::parse_fragment(fragment);
    let text = html.root_element().text().collect::<Vec<_>>().join(" ");
    normalize_whitespace(&text)
}

/// Text under `selector` in a full article page, or `None` when nothing matches.
pub fn article_body_text(page: &str, selector: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    let document = Html::parse_document(page);
    let text = document
        .select(&selector)
        .map(|el| el.text().collect::<Vec<_>>().join(" "))
        .collect::<Vec<_>>()
        .join("\n");
    let text = normalize_whitespace(&text);
    (!text.is_empty()).then_some(text)
}

/// Best-effort publication timestamp.
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc2822(s)
        .or_else(|_| DateTime::parse_from_rfc3339(s))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(s.get(..10)?, "%Y-%m-%d")
                .ok()?
                .and_hms_opt(0, 0, 0)
                .map(|n| n.and_utc())
        })
}

fn escape_ampersands(segment: &str) -> Cow<'_, str> {
    AMPERSAND.replace_all(segment, |caps: &Captures| match caps.get(1).map(|m| m.as_str()) {
        Some(r) if r.starts_with('#') || matches!(r, "amp;" | "lt;" | "gt;" | "quot;" | "apos;") => {
            caps[0].to_string()
        }
        Some(r) => format!("&amp;{r}"),
        None => "&amp;".to_string(),
    })
}

/// Escape every `&` that is not an XML reference, leaving CDATA sections untouched.
///
/// HTML entities such as `&eacute;` survive as literal text and are decoded by
/// [`strip_html`].
fn escape_stray_ampersands(xml: &str) -> String {
    let mut out = String::with_capacity(xml.len());
    let mut last = 0;
    for cdata in CDATA.find_iter(xml) {
        out.push_str(&escape_ampersands(&xml[last..cdata.start()]));
        out.push_str(cdata.as_str());
        last = cdata.end();
    }
    out.push_str(&escape_ampersands(&xml[last..]));
    out
}

/// Wrap text fields holding inline markup (`<i>`, `<sup>`, ...) in CDATA.
fn wrap_inline_markup(block: &str) -> String {
    let mut out = block.to_string();
    for field in MARKUP_FIELDS.iter() {
        out = field
            .replace_all(&out, |caps: &Captures| {
                let attrs = caps.get(2).map_or("", |m| m.as_str());
                let inner = &caps[3];
                if attrs.ends_with('/')
                    || !inner.contains('<')
                    || inner.contains("<![CDATA[")
                    || inner.contains("]]>")
                {
                    return caps[0].to_string();
                }
                format!("<{name}{attrs}><![CDATA[{inner}]]></{name}>", name = &caps[1])
            })
            .into_owned();
    }
    out
}

fn parse_item(block: &str) -> Result<RawItem, quick_xml::DeError> {
    quick_xml::de::from_str(&escape_stray_ampersands(&wrap_inline_markup(block)))
}

fn pick_link(item: &RawItem) -> Option<&str> {
    let alternate = item
        .link
        .iter()
        .filter(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
        .find_map(|l| l.href.as_deref());
    let any_href = || item.link.iter().find_map(|l| l.href.as_deref());
    let text = || {
        item.link
            .iter()
            .filter_map(|l| l.text.as_deref())
            .map(str::trim)
            .find(|t| !t.is_empty())
    };
    let guid = || first_text(&item.guid).filter(|g| g.starts_with("http"));

    alternate
        .or_else(any_href)
        .or_else(text)
        .or_else(guid)
        .map(str::trim)
        .filter(|l| !l.is_empty())
}

fn pick_image(item: &RawItem, raw_description: &str, article_url: &Url) -> Option<String> {
    if let Some(url) = item.thumbnail.iter().find_map(|m| m.url.as_deref()) {
        return Some(url.to_string());
    }
    let enclosure = item.enclosure.iter().find(|m| {
        m.kind
            .as_deref()
            .is_some_and(|k| k.to_ascii_lowercase().starts_with("image/"))
    });
    if let Some(url) = enclosure.and_then(|m| m.url.as_deref()) {
        return Some(url.to_string());
    }
    if !raw_description.contains("<img") {
        return None;
    }
    let html = Html::parse_fragment(raw_description);
    let src = html.select(&IMG).next()?.value().attr("src")?;
    article_url.join(src).ok().map(|u| u.to_string())
}

fn to_candidate(source: &Source, item: &RawItem) -> Option<ArticleCandidate> {
    let title = strip_html(first_text(&item.title)?);
    if title.is_empty() {
        return None;
    }
    let url = source.listing_url.join(pick_link(item)?).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }

    let raw_description = first_text(&item.description)
        .or_else(|| first_text(&item.summary))
        .or_else(|| first_text(&item.encoded))
        .or_else(|| first_text(&item.content))
        .unwrap_or_default();
    let description = match strip_html(raw_description) {
        d if d.is_empty() => title.clone(),
        d => d,
    };

    let published_at = [&item.pub_date, &item.dc_date, &item.published, &item.updated]
        .into_iter()
        .filter_map(|nodes| first_text(nodes))
        .find_map(parse_date);

    Some(ArticleCandidate {
        source_id: source.id.clone(),
        source_name: source.name.clone(),
        category: source.category.clone(),
        image_url: pick_image(item, raw_description, &url),
        url: url.to_string(),
        title_raw: title,
        description,
        published_at,
    })
}

/// Extract candidates from one source's listing, preserving listing order.
#[instrument(level = "info", skip_all, fields(source = %source.id, bytes = raw.len()))]
pub fn extract(source: &Source, raw: &str) -> Extraction {
    let blocks: Vec<&str> = ITEM_BLOCK.find_iter(raw).map(|m| m.as_str()).collect();
    if blocks.is_empty() {
        if let Err(e) = quick_xml::de::from_str::<FeedShell>(&escape_stray_ampersands(raw)) {
            warn!(error = %e, "Listing is not a parseable feed");
            return Extraction {
                warning: Some(ExtractWarning::Unparseable(e.to_string())),
                ..Default::default()
            };
        }
    }

    let mut extraction = Extraction::default();
    for block in &blocks {
        let item = match parse_item(block) {
            Ok(item) => item,
            Err(e) => {
                extraction.dropped += 1;
                debug!(error = %e, "Dropped malformed item");
                continue;
            }
        };
        match to_candidate(source, &item) {
            Some(candidate) => extraction.candidates.push(candidate),
            None => {
                extraction.dropped += 1;
                debug!(title = ?first_text(&item.title), "Dropped item missing title or link");
            }
        }
    }

    if extraction.candidates.is_empty() {
        warn!(items = blocks.len(), "Listing yielded zero candidates");
        extraction.warning = Some(ExtractWarning::ZeroYield);
    } else {
        debug!(
            candidates = extraction.candidates.len(),
            dropped = extraction.dropped,
            "Extracted candidates"
        );
    }
    extraction
}
