//! Proxy source list
//!
//! One source per line: `source_id,url,response_type`. `#` starts a comment
//! line, an optional header row is skipped, fields may be double-quoted with
//! `""` as an escaped quote. Bad rows are skipped with a warning.

use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use crate::security::{SafeFetchProfile, UrlPolicy};
use crate::transport::{ResponseMode, SafeFetcher, SafeRequest};
use crate::{Error, Result};

static SOURCE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").expect("static regex"));

/// One upstream MCP endpoint configured by the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySource {
    /// Unique id, used as the outward tool-name prefix
    pub id: String,
    /// Endpoint URL (already validated)
    pub url: Url,
    /// Preferred response mode
    pub response_mode: ResponseMode,
}

/// Parse a source list. Every URL must pass `policy`.
pub fn parse_source_list(text: &str, policy: &UrlPolicy) -> Vec<ProxySource> {
    let mut sources = Vec::new();
    let mut seen = HashSet::new();
    let mut first_record = true;

    for (index, raw) in text.lines().enumerate() {
        let line_no = index + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let is_first = std::mem::replace(&mut first_record, false);

        let Some(fields) = split_fields(line) else {
            warn!(line = line_no, "Skipping proxy source row with unbalanced quotes");
            continue;
        };
        if is_first && looks_like_header(&fields) {
            continue;
        }
        let [id, url, mode] = fields.as_slice() else {
            warn!(line = line_no, fields = fields.len(), "Skipping proxy source row: expected 3 fields");
            continue;
        };

        if !SOURCE_ID.is_match(id) {
            warn!(line = line_no, source = %id, "Skipping proxy source with invalid id");
            continue;
        }
        let response_mode = match mode.parse::<ResponseMode>() {
            Ok(m) => m,
            Err(e) => {
                warn!(line = line_no, source = %id, error = %e, "Skipping proxy source");
                continue;
            }
        };
        let url = match policy.validate(url) {
            Ok(u) => u,
            Err(e) => {
                warn!(line = line_no, source = %id, error = %e, "Skipping proxy source with rejected URL");
                continue;
            }
        };
        if !seen.insert(id.clone()) {
            warn!(line = line_no, source = %id, "Skipping duplicate proxy source id");
            continue;
        }

        sources.push(ProxySource {
            id: id.clone(),
            url,
            response_mode,
        });
    }

    sources
}

/// Load the source list from a local path or a single https fetch.
///
/// # Errors
///
/// Returns an error if the file cannot be read, the location is a plain-http
/// URL, or the fetch fails.
pub async fn load_source_list(
    location: &str,
    fetcher: &SafeFetcher,
    fetch_profile: &SafeFetchProfile,
    url_policy: &UrlPolicy,
) -> Result<Vec<ProxySource>> {
    let text = if location.starts_with("https://") {
        let response = fetcher
            .fetch(location, fetch_profile, SafeRequest::get(), &CancellationToken::new())
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Config(format!(
                "proxy source list {location} returned HTTP {status}"
            )));
        }
        response.text().await?
    } else if location.contains("://") {
        return Err(Error::Config(format!(
            "proxy source list must be a local path or an https URL: {location}"
        )));
    } else {
        tokio::fs::read_to_string(Path::new(location))
            .await
            .map_err(|e| Error::Config(format!("Failed to read proxy source list {location}: {e}")))?
    };

    let sources = parse_source_list(&text, url_policy);
    info!(location = %location, count = sources.len(), "Loaded proxy sources");
    Ok(sources)
}

fn looks_like_header(fields: &[String]) -> bool {
    fields.len() == 3
        && fields[2].parse::<ResponseMode>().is_err()
        && Url::parse(&fields[1]).is_err()
}

/// Split one line into fields. `None` for an unterminated quote.
fn split_fields(line: &str) -> Option<Vec<String>> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut chars = line.chars().peekable();
    let mut quoted = false;
    let mut was_quoted = false;

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    quoted = false;
                }
            }
            '"' if field.trim().is_empty() && !was_quoted => {
                field.clear();
                quoted = true;
                was_quoted = true;
            }
            ',' if !quoted => {
                fields.push(finish_field(&mut field, was_quoted));
                was_quoted = false;
            }
            _ => field.push(c),
        }
    }

    if quoted {
        return None;
    }
    fields.push(finish_field(&mut field, was_quoted));
    Some(fields)
}

fn finish_field(field: &mut String, was_quoted: bool) -> String {
    let value = std::mem::take(field);
    if was_quoted {
        // Text after the closing quote is dropped except whitespace
        value.trim_end().to_string()
    } else {
        value.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn policy() -> UrlPolicy {
        UrlPolicy::new(["http", "https"])
    }

    #[test]
    fn parses_rows_with_header_and_comments() {
        let text = "\
source_id,url,response_type
# staging tools
search,https://search.example/mcp,JSON
\"files\",\"https://files.example/mcp?x=1,2\",sse
";
        let sources = parse_source_list(text, &policy());
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].id, "search");
        assert_eq!(sources[0].response_mode, ResponseMode::Json);
        assert_eq!(sources[1].id, "files");
        assert_eq!(sources[1].url.as_str(), "https://files.example/mcp?x=1,2");
        assert_eq!(sources[1].response_mode, ResponseMode::Sse);
    }

    #[test]
    fn skips_malformed_and_duplicate_rows() {
        let text = "\
a,https://a.example/mcp,JSON
a,https://other.example/mcp,JSON
b,https://b.example/mcp
c,ftp://c.example/mcp,JSON
d,https://d.example/mcp,XML
bad id,https://e.example/mcp,JSON
\"f,https://f.example/mcp,JSON
g,https://g.example/mcp,SSE
";
        let ids: Vec<String> = parse_source_list(text, &policy())
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["a".to_string(), "g".to_string()]);
    }

    #[test]
    fn quoted_fields_unescape_double_quotes() {
        let fields = split_fields(r#""a ""b"" c", x ,"y""#).unwrap();
        assert_eq!(fields, vec!["a \"b\" c", "x", "y"]);
    }

    #[test]
    fn unterminated_quote_is_rejected() {
        assert!(split_fields("\"abc,def").is_none());
    }

    #[test]
    fn first_data_row_is_not_mistaken_for_header() {
        let sources = parse_source_list("only,https://only.example/,JSON", &policy());
        assert_eq!(sources.len(), 1);
    }

    #[tokio::test]
    async fn loads_from_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sources.csv");
        std::fs::write(&path, "x,http://127.0.0.1:9/mcp,JSON\n").unwrap();

        let config = crate::config::Config::default();
        let profiles = crate::security::ProfileSet::from_config(&config);
        let fetcher = SafeFetcher::new(
            crate::security::RebindingGuard::system(crate::security::HostAllowlist::default()),
            crate::transport::FetcherOptions::default(),
            std::sync::Arc::default(),
        )
        .unwrap();

        let sources = load_source_list(
            path.to_str().unwrap(),
            &fetcher,
            profiles.external_https_only(),
            &profiles.http_or_https().policy,
        )
        .await
        .unwrap();
        assert_eq!(sources[0].id, "x");
    }

    #[tokio::test]
    async fn plain_http_location_is_rejected() {
        let config = crate::config::Config::default();
        let profiles = crate::security::ProfileSet::from_config(&config);
        let fetcher = SafeFetcher::new(
            crate::security::RebindingGuard::system(crate::security::HostAllowlist::default()),
            crate::transport::FetcherOptions::default(),
            std::sync::Arc::default(),
        )
        .unwrap();

        let err = load_source_list(
            "http://lists.example/sources.csv",
            &fetcher,
            profiles.external_https_only(),
            &profiles.http_or_https().policy,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
