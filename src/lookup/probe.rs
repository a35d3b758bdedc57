//! Web page probe.
//!
//! Fetches the URL held in one field and records the page title. Block pages
//! and throttling statuses are reported as rate limits so the engine rotates
//! to a fresh identity.

use super::{Lookup, LookupResult, Precheck, transport_failure};
use crate::models::{Result, Row, StageConfig, StagehandError};
use regex::Regex;
use reqwest::Url;
use tracing::debug;

/// Status recorded when the source field holds no usable URL.
pub const INVALID_SOURCE_STATUS: &str = "invalid";

/// Turn a raw cell into a fetchable URL; bare hosts get `https://`.
pub fn normalize_url(raw: &str) -> Option<Url> {
    let raw = raw.trim();
    if raw.is_empty() || raw.chars().any(char::is_whitespace) {
        return None;
    }
    let candidate = if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else if raw.contains("://") {
        return None;
    } else {
        format!("https://{raw}")
    };
    let url = Url::parse(&candidate).ok()?;
    let host = url.host_str()?;
    if !host.contains('.') && host != "localhost" && url.port().is_none() {
        return None;
    }
    Some(url)
}

/// Text of the first `<title>` element, whitespace-collapsed.
pub fn extract_title(re: &Regex, html: &str) -> Option<String> {
    let raw = re.captures(html)?.get(1)?.as_str();
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let decoded = collapsed
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");
    (!decoded.is_empty()).then_some(decoded)
}

/// Probe lookup over a URL field.
#[derive(Debug, Clone)]
pub struct ProbeLookup {
    source_field: String,
    target_field: String,
    /// Lower-cased fragments that identify a block page
    block_markers: Vec<String>,
    title_re: Regex,
}

impl ProbeLookup {
    pub fn new(stage: &StageConfig) -> Result<Self> {
        let title_re = Regex::new(r"(?is)<title[^>]*>(.*?)</title>")
            .map_err(|e| StagehandError::Internal(format!("title pattern: {e}")))?;
        Ok(Self {
            source_field: stage.source_field.clone(),
            target_field: stage.target_field.clone(),
            block_markers: stage
                .block_markers
                .iter()
                .map(|m| m.to_lowercase())
                .collect(),
            title_re,
        })
    }

    fn is_blocked(&self, body: &str) -> bool {
        let lower = body.to_lowercase();
        self.block_markers.iter().any(|m| lower.contains(m.as_str()))
    }
}

impl Lookup<reqwest::Client> for ProbeLookup {
    fn precheck(&self, row: &Row) -> Precheck {
        match normalize_url(row.get_trimmed(&self.source_field)) {
            Some(_) => Precheck::Proceed,
            None => Precheck::Skip(INVALID_SOURCE_STATUS.to_string()),
        }
    }

    async fn lookup(&mut self, session: &reqwest::Client, row: &Row) -> Result<LookupResult> {
        let Some(url) = normalize_url(row.get_trimmed(&self.source_field)) else {
            return Ok(LookupResult::invalid(INVALID_SOURCE_STATUS));
        };

        let response = match session.get(url.clone()).send().await {
            Ok(r) => r,
            Err(e) => return Ok(transport_failure(&e)),
        };

        let status = response.status().as_u16();
        match status {
            403 | 429 => return Ok(LookupResult::rate_limited("search_limit")),
            404 | 410 => return Ok(LookupResult::invalid("no_result")),
            500..=599 => return Ok(LookupResult::transient("server_error")),
            200..=299 => {}
            other => return Ok(LookupResult::invalid(format!("http_{other}"))),
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return Ok(transport_failure(&e)),
        };

        if self.is_blocked(&body) {
            debug!(url = %url, "Block page detected");
            return Ok(LookupResult::rate_limited("search_limit"));
        }

        let title = extract_title(&self.title_re, &body).unwrap_or_default();
        Ok(LookupResult::found("found").with_field(&self.target_field, title))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::Outcome;
    use crate::lookup::tests::serve;
    use crate::models::StageKind;
    use std::path::PathBuf;

    fn stage() -> StageConfig {
        StageConfig {
            kind: StageKind::Probe,
            input_dir: None,
            output_dir: PathBuf::from("out"),
            output_prefix: String::new(),
            required_columns: Vec::new(),
            source_field: "Website".into(),
            target_field: "Website Title".into(),
            prune_status: Some("no_result".into()),
            use_circuit: false,
            system_prompt: None,
            block_markers: vec!["Too Many Requests".into(), "access denied".into()],
        }
    }

    fn row(url: &str) -> Row {
        Row::from_pairs([("Website", url)])
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(
            normalize_url("example.com/about").unwrap().as_str(),
            "https://example.com/about"
        );
        assert!(normalize_url("http://127.0.0.1:8080").is_some());
        assert!(normalize_url("").is_none());
        assert!(normalize_url("not a url").is_none());
        assert!(normalize_url("nodots").is_none());
        assert!(normalize_url("ftp://example.com").is_none());
    }

    #[test]
    fn test_precheck_skips_unusable_sources() {
        let probe = ProbeLookup::new(&stage()).unwrap();
        assert_eq!(probe.precheck(&row("")), Precheck::Skip("invalid".into()));
        assert_eq!(probe.precheck(&row("example.com")), Precheck::Proceed);
    }

    #[test]
    fn test_extract_title() {
        let probe = ProbeLookup::new(&stage()).unwrap();
        let html = "<html><head><TITLE lang=en>\n  Acme &amp; Co\n | Home </TITLE></head></html>";
        assert_eq!(
            extract_title(&probe.title_re, html).as_deref(),
            Some("Acme & Co | Home")
        );
        assert_eq!(extract_title(&probe.title_re, "<p>none</p>"), None);
    }

    #[tokio::test]
    async fn test_status_and_body_mapping() {
        let base = serve(vec![
            (200, "<title>Acme</title>".to_string()),
            (200, "<h1>Too many requests sent from your network</h1>".to_string()),
            (404, String::new()),
            (429, String::new()),
            (502, String::new()),
        ])
        .await;
        let mut probe = ProbeLookup::new(&stage()).unwrap();
        let client = reqwest::Client::new();
        let row = row(&base);

        let r = probe.lookup(&client, &row).await.unwrap();
        assert_eq!(r.outcome, Outcome::Found);
        assert_eq!(r.fields, vec![("Website Title".to_string(), "Acme".to_string())]);

        let r = probe.lookup(&client, &row).await.unwrap();
        assert_eq!((r.outcome, r.status.as_str()), (Outcome::RateLimited, "search_limit"));

        let r = probe.lookup(&client, &row).await.unwrap();
        assert_eq!((r.outcome, r.status.as_str()), (Outcome::Invalid, "no_result"));

        let r = probe.lookup(&client, &row).await.unwrap();
        assert_eq!(r.outcome, Outcome::RateLimited);

        let r = probe.lookup(&client, &row).await.unwrap();
        assert_eq!(r.outcome, Outcome::Transient);
    }
}
