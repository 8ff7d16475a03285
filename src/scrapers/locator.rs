//! Search page locators.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use crate::models::PartitionKey;

/// Default search URL for the CIA reading room, filtered to one year.
pub const DEFAULT_SEARCH_TEMPLATE: &str = "https://www.cia.gov/readingroom/search/site?page={page}&f%5B0%5D=ds_created%3A%5B{year}-01-01T00%3A00%3A00Z%20TO%20{next_year}-01-01T00%3A00%3A00Z%5D";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LocatorError {
    #[error("no partition (year filter) found in locator URL: {0}")]
    MissingPartition(String),
}

/// Identifies one search result page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageLocator {
    pub partition: PartitionKey,
    pub page: u32,
    /// Explicit URL to fetch instead of expanding the search template.
    pub url: Option<String>,
}

fn page_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[?&]page=(\d+)").expect("valid page regex"))
}

fn year_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{4})-01-01T00").expect("valid year regex"))
}

impl PageLocator {
    pub fn new(partition: PartitionKey, page: u32) -> Self {
        Self {
            partition,
            page,
            url: None,
        }
    }

    /// Parse an operator-supplied search URL. A missing `page=` means page 0;
    /// the first `YYYY-01-01T00` date in the URL is the partition.
    pub fn from_url(url: &str) -> Result<Self, LocatorError> {
        let page = page_regex()
            .captures(url)
            .and_then(|c| c[1].parse::<u32>().ok())
            .unwrap_or(0);
        let partition = year_regex()
            .captures(url)
            .and_then(|c| c[1].parse::<i32>().ok())
            .map(PartitionKey)
            .ok_or_else(|| LocatorError::MissingPartition(url.to_string()))?;

        Ok(Self {
            partition,
            page,
            url: Some(url.to_string()),
        })
    }

    /// Expand a search template. Placeholders: `{page}`, `{year}`, `{next_year}`.
    pub fn expand(&self, template: &str) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        template
            .replace("{page}", &self.page.to_string())
            .replace("{next_year}", &self.partition.successor().to_string())
            .replace("{year}", &self.partition.to_string())
    }
}

impl fmt::Display for PageLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} page {}", self.partition, self.page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_url_extracts_page_and_year() {
        let url = "https://www.cia.gov/readingroom/search/site?page=17&f%5B0%5D=ds_created%3A%5B1987-01-01T00%3A00%3A00Z%20TO%201988-01-01T00%3A00%3A00Z%5D";
        let loc = PageLocator::from_url(url).unwrap();
        assert_eq!(loc.partition, PartitionKey(1987));
        assert_eq!(loc.page, 17);
        assert_eq!(loc.expand(DEFAULT_SEARCH_TEMPLATE), url);
    }

    #[test]
    fn test_from_url_without_page_starts_at_zero() {
        let loc = PageLocator::from_url("https://x/search/site?f=2001-01-01T00:00:00Z").unwrap();
        assert_eq!(loc.page, 0);
        assert_eq!(loc.partition, PartitionKey(2001));
    }

    #[test]
    fn test_from_url_requires_year() {
        assert!(matches!(
            PageLocator::from_url("https://x/search/site?page=3"),
            Err(LocatorError::MissingPartition(_))
        ));
    }

    #[test]
    fn test_expand_template() {
        let url = PageLocator::new(PartitionKey(2012), 3).expand(DEFAULT_SEARCH_TEMPLATE);
        assert!(url.contains("page=3&"));
        assert!(url.contains("2012-01-01T00"));
        assert!(url.contains("TO%202013-01-01T00"));
    }
}
