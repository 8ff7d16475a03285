//! HTML extraction for search result and document detail pages.

use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::scrapers::DetailPage;
use crate::models::{DocumentReference, PartitionKey};
use crate::storage::content_hash;

fn rdp_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)cia-rdp[^\s/?#&]+").expect("valid document number regex"))
}

fn static_selector(cell: &'static OnceLock<Selector>, css: &str) -> &'static Selector {
    cell.get_or_init(|| Selector::parse(css).expect("valid static selector"))
}

/// Reduce text to characters safe for a file stem.
pub fn slugify(text: &str) -> String {
    let slug: String = text
        .trim()
        .chars()
        .filter_map(|c| match c {
            c if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') => Some(c),
            c if c.is_whitespace() => Some('_'),
            _ => None,
        })
        .collect();
    slug.trim_start_matches('.').chars().take(100).collect()
}

/// Stable document id for a detail URL: the archive document number
/// (`CIA-RDP…`) when present, otherwise the slugified last path segment.
pub fn derive_document_id(url: &str) -> String {
    if let Some(m) = rdp_regex().find(url) {
        return m.as_str().to_uppercase();
    }

    let segment = Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segs| segs.rfind(|s| !s.is_empty()).map(str::to_string))
        })
        .unwrap_or_default();
    let slug = slugify(&segment);
    if slug.is_empty() {
        content_hash(url.as_bytes())[..16].to_string()
    } else {
        slug
    }
}

fn resolve(base: &Url, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty()
        || href.starts_with('#')
        || href.starts_with("javascript:")
        || href.starts_with("mailto:")
    {
        return None;
    }
    base.join(href).ok().map(String::from)
}

fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Extract document references from a search results page, in page order.
pub fn parse_search_results(
    html: &str,
    page_url: &str,
    link_selector: &Selector,
    link_filter: &str,
    partition: PartitionKey,
) -> Vec<DocumentReference> {
    let Ok(base) = Url::parse(page_url) else {
        return Vec::new();
    };
    let document = Html::parse_document(html);
    let mut seen = HashSet::new();
    let mut references = Vec::new();

    for element in document.select(link_selector) {
        let Some(url) = element.value().attr("href").and_then(|h| resolve(&base, h)) else {
            continue;
        };
        if !url.contains(link_filter) || !seen.insert(url.clone()) {
            continue;
        }
        let title = element_text(element);
        references.push(DocumentReference {
            id: derive_document_id(&url),
            url,
            partition,
            title: (!title.is_empty()).then_some(title),
        });
    }
    references
}

/// Whether the page's main content reports itself unavailable.
pub fn page_is_unavailable(html: &str, marker: &str) -> bool {
    static MAIN: OnceLock<Selector> = OnceLock::new();
    static BODY: OnceLock<Selector> = OnceLock::new();

    let document = Html::parse_document(html);
    let text = document
        .select(static_selector(&MAIN, "#block-system-main"))
        .next()
        .or_else(|| document.select(static_selector(&BODY, "body")).next())
        .map(element_text)
        .unwrap_or_default();
    text.to_lowercase().contains(&marker.to_lowercase())
}

/// Extract title, file links and metadata rows from a document detail page.
pub fn parse_detail_page(html: &str, page_url: &str, unavailable_marker: &str) -> DetailPage {
    static TITLE: OnceLock<Selector> = OnceLock::new();
    static LINKS: OnceLock<Selector> = OnceLock::new();
    static FIELD: OnceLock<Selector> = OnceLock::new();
    static LABEL: OnceLock<Selector> = OnceLock::new();
    static ITEM: OnceLock<Selector> = OnceLock::new();

    let unavailable = page_is_unavailable(html, unavailable_marker);
    let Ok(base) = Url::parse(page_url) else {
        return DetailPage {
            unavailable,
            ..DetailPage::default()
        };
    };
    let document = Html::parse_document(html);

    let title = document
        .select(static_selector(&TITLE, "title"))
        .next()
        .map(element_text)
        .filter(|t| !t.is_empty());

    let mut seen = HashSet::new();
    let mut file_urls = Vec::new();
    for link in document.select(static_selector(&LINKS, "a[href]")) {
        let Some(url) = link.value().attr("href").and_then(|h| resolve(&base, h)) else {
            continue;
        };
        let lower = url.to_lowercase();
        let is_file = lower.ends_with(".pdf")
            || lower.contains("/docs/")
            || element_text(link).to_lowercase().contains("pdf");
        if is_file && seen.insert(url.clone()) {
            file_urls.push(url);
        }
    }

    let mut fields = BTreeMap::new();
    for row in document.select(static_selector(&FIELD, "div.field")) {
        let label = row.select(static_selector(&LABEL, ".field-label")).next();
        let value = row.select(static_selector(&ITEM, ".field-item")).next();
        if let (Some(label), Some(value)) = (label, value) {
            let label = element_text(label).trim_end_matches(':').trim().to_string();
            if !label.is_empty() {
                fields.insert(label, element_text(value));
            }
        }
    }

    DetailPage {
        title,
        unavailable,
        file_urls,
        fields,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESULTS: &str = r#"
        <html><body><div id="block-system-main"><div><ol>
          <li><h3><a href="/readingroom/document/cia-rdp79t00975a000100010001-2">Daily Brief</a></h3></li>
          <li><h3><a href="https://www.cia.gov/readingroom/document/0005512345">Memo  on
              Cuba</a></h3></li>
          <li><h3><a href="/about">About</a></h3></li>
          <li><h3><a href="/readingroom/document/cia-rdp79t00975a000100010001-2">Dup</a></h3></li>
        </ol></div></div></body></html>"#;

    #[test]
    fn test_parse_search_results() {
        let selector = Selector::parse("#block-system-main > div > ol > li h3 a").unwrap();
        let refs = parse_search_results(
            RESULTS,
            "https://www.cia.gov/readingroom/search/site?page=0",
            &selector,
            "/readingroom/",
            PartitionKey(1975),
        );

        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].id, "CIA-RDP79T00975A000100010001-2");
        assert_eq!(
            refs[0].url,
            "https://www.cia.gov/readingroom/document/cia-rdp79t00975a000100010001-2"
        );
        assert_eq!(refs[1].id, "0005512345");
        assert_eq!(refs[1].title.as_deref(), Some("Memo on Cuba"));
        assert_eq!(refs[1].partition, PartitionKey(1975));
    }

    #[test]
    fn test_parse_detail_page() {
        let html = r#"
            <html><head><title>Soviet Grain | FOIA Reading Room</title></head><body>
            <div id="block-system-main">
              <div class="field"><div class="field-label">Document Type:</div><div class="field-item">CREST</div></div>
              <a href="/readingroom/docs/CIA-RDP85T00875R001700030040-5.pdf">CIA-RDP85T00875R001700030040-5.pdf</a>
              <a href="/readingroom/docs/CIA-RDP85T00875R001700030040-5.pdf">again</a>
              <a href="/readingroom/search">Search</a>
            </div></body></html>"#;

        let page = parse_detail_page(html, "https://www.cia.gov/readingroom/document/x", "unavailable");
        assert!(!page.unavailable);
        assert_eq!(page.title.as_deref(), Some("Soviet Grain | FOIA Reading Room"));
        assert_eq!(
            page.file_urls,
            vec!["https://www.cia.gov/readingroom/docs/CIA-RDP85T00875R001700030040-5.pdf"]
        );
        assert_eq!(page.fields.get("Document Type").map(String::as_str), Some("CREST"));
    }

    #[test]
    fn test_unavailable_marker_only_in_main_content() {
        let html = r#"<html><body><script>var s = "unavailable";</script>
            <div id="block-system-main">This document is currently Unavailable.</div></body></html>"#;
        assert!(page_is_unavailable(html, "unavailable"));

        let html = r#"<html><body><nav>Service unavailable notices</nav>
            <div id="block-system-main">Fine document</div></body></html>"#;
        assert!(!page_is_unavailable(html, "unavailable"));
    }

    #[test]
    fn test_derive_document_id_fallbacks() {
        assert_eq!(
            derive_document_id("https://www.cia.gov/readingroom/document/06754123/"),
            "06754123"
        );
        assert_eq!(slugify("  ..Weird name (copy) #2 "), "Weird_name_copy_2");
        assert_eq!(derive_document_id("https://www.cia.gov/").len(), 16);
    }
}
