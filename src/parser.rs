//! Stateless helpers for CVE identifiers and advisory titles.

use once_cell::sync::Lazy;
use regex_lite::Regex;

static VALID_CVE_REGEX: Lazy<Result<Regex, regex_lite::Error>> =
    Lazy::new(|| Regex::new(r"^CVE-\d{4}-\d{4,}$"));
static CVE_REGEX: Lazy<Result<Regex, regex_lite::Error>> =
    Lazy::new(|| Regex::new(r"(?i)(CVE-\d{4}-\d{4,})"));
// Upstream titles use placeholders like "CVE-2022-xxxx" and suffixes like "-2"
static CVE_TITLE_PREFIX_REGEX: Lazy<Result<Regex, regex_lite::Error>> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*CVE-[0-9a-z]{4}-[0-9a-z]{4,}(?:-[0-9a-z]+)?\s*:(.*)$")
});

pub struct AdvisoryParser;

impl AdvisoryParser {
    /// Whether `candidate` is a well-formed CVE identifier (`CVE-YYYY-NNNN+`).
    ///
    /// Placeholders such as `CVE-2022-xxxx` are rejected.
    pub fn is_valid_cve(candidate: &str) -> bool {
        match &*VALID_CVE_REGEX {
            Ok(regex) => regex.is_match(candidate),
            Err(_) => false,
        }
    }

    /// Strip a leading `CVE-...:` token from an advisory title.
    ///
    /// Returns the title unchanged when it does not start with one.
    pub fn title_without_cve(title: &str) -> &str {
        if let Ok(regex) = &*CVE_TITLE_PREFIX_REGEX
            && let Some(caps) = regex.captures(title)
            && let Some(rest) = caps.get(1)
        {
            return rest.as_str().trim();
        }
        title
    }

    /// Extract the first CVE identifier found in `text`, upper-cased.
    pub fn extract_cve(text: &str) -> Option<String> {
        if let Ok(regex) = &*CVE_REGEX
            && let Some(caps) = regex.captures(text)
        {
            return Some(caps[1].to_uppercase());
        }
        None
    }

    /// Year component of a valid CVE identifier.
    pub fn cve_year(cve: &str) -> Option<i32> {
        if !Self::is_valid_cve(cve) {
            return None;
        }
        cve.get(4..8)?.parse().ok()
    }
}
