//! Line formats of the success and error logs.
//!
//! Success log: `<url>` or `<collection>:::<url>`.
//! Error log: `<url>` or `<url> (private)`.

use crate::constants::{PRIVATE_SUFFIX, SCOPE_SEPARATOR};
use crate::content_id::{identify, ContentId};

/// One line of the success log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuccessRecord {
    pub scope: Option<String>,
    pub url: String,
}

impl SuccessRecord {
    #[must_use]
    pub fn new(url: &str, scope: Option<&str>) -> Self {
        Self {
            scope: scope.filter(|s| !s.is_empty()).map(str::to_string),
            url: url.trim().to_string(),
        }
    }

    /// Parse a log line. Blank lines yield `None`.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match line.split_once(SCOPE_SEPARATOR) {
            Some((scope, url)) if !scope.is_empty() => Some(Self {
                scope: Some(scope.to_string()),
                url: url.trim().to_string(),
            }),
            Some((_, url)) => Some(Self {
                scope: None,
                url: url.trim().to_string(),
            }),
            None => Some(Self {
                scope: None,
                url: line.to_string(),
            }),
        }
    }

    #[must_use]
    pub fn to_line(&self) -> String {
        match &self.scope {
            Some(scope) => format!("{scope}{SCOPE_SEPARATOR}{}", self.url),
            None => self.url.clone(),
        }
    }

    #[must_use]
    pub fn content_id(&self) -> Option<ContentId> {
        identify(&self.url)
    }
}

/// One line of an error log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEntry {
    pub url: String,
    pub private: bool,
}

impl ErrorEntry {
    #[must_use]
    pub fn new(url: &str, private: bool) -> Self {
        Self {
            url: url.trim().to_string(),
            private,
        }
    }

    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        Some(match line.strip_suffix(PRIVATE_SUFFIX) {
            Some(url) => Self::new(url, true),
            None => Self::new(line, false),
        })
    }

    #[must_use]
    pub fn to_line(&self) -> String {
        if self.private {
            format!("{}{PRIVATE_SUFFIX}", self.url)
        } else {
            self.url.clone()
        }
    }

    /// Whether this entry refers to `url`, by exact string or by content id.
    #[must_use]
    pub fn matches(&self, url: &str) -> bool {
        crate::content_id::same_content(&self.url, url)
    }
}
