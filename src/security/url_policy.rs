//! Declarative URL policies.
//!
//! A [`UrlPolicy`] decides whether a URL may be requested at all. Checks run
//! in a fixed order (protocol, credentials, host, port, path, query, custom
//! validator) and never touch the network.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use percent_encoding::percent_decode_str;
use url::Url;

use crate::error::ViolationKind;
use crate::{Error, Result};

/// Profile-specific check that runs after every built-in rule.
pub type CustomValidator = Arc<dyn Fn(&Url) -> std::result::Result<(), String> + Send + Sync>;

/// How query parameters are treated.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum QueryRule {
    /// Any query string
    #[default]
    AllowAll,
    /// No query parameters at all
    AllowNone,
    /// Only the listed keys
    AllowKeys(BTreeSet<String>),
}

/// Immutable URL validation policy.
#[derive(Clone)]
pub struct UrlPolicy {
    protocols: BTreeSet<String>,
    hosts: Option<BTreeSet<String>>,
    host_suffixes: Option<BTreeSet<String>>,
    require_default_port: bool,
    path_prefix: Option<String>,
    query: QueryRule,
    allow_credentials: bool,
    validator: Option<CustomValidator>,
}

impl fmt::Debug for UrlPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UrlPolicy")
            .field("protocols", &self.protocols)
            .field("hosts", &self.hosts)
            .field("host_suffixes", &self.host_suffixes)
            .field("require_default_port", &self.require_default_port)
            .field("path_prefix", &self.path_prefix)
            .field("query", &self.query)
            .field("allow_credentials", &self.allow_credentials)
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

impl UrlPolicy {
    /// Policy accepting the given schemes (without `:`) and nothing else yet
    /// restricted: any host, any port, any query, no credentials.
    pub fn new<I, S>(protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            protocols: protocols
                .into_iter()
                .map(|p| p.as_ref().trim_end_matches(':').to_ascii_lowercase())
                .collect(),
            hosts: None,
            host_suffixes: None,
            require_default_port: false,
            path_prefix: None,
            query: QueryRule::AllowAll,
            allow_credentials: false,
            validator: None,
        }
    }

    /// Restrict to exact hostnames.
    #[must_use]
    pub fn allow_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.hosts
            .get_or_insert_with(BTreeSet::new)
            .extend(hosts.into_iter().map(|h| normalize_host(h.as_ref())));
        self
    }

    /// Allow strict subdomains of the given domains (`hf.space` admits
    /// `app.hf.space`, not `hf.space` itself).
    #[must_use]
    pub fn allow_subdomains_of<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.host_suffixes
            .get_or_insert_with(BTreeSet::new)
            .extend(domains.into_iter().map(|d| {
                let domain = normalize_host(d.as_ref().trim_start_matches("*."));
                domain.trim_start_matches('.').to_string()
            }));
        self
    }

    /// Reject explicit non-default ports.
    #[must_use]
    pub fn require_default_port(mut self) -> Self {
        self.require_default_port = true;
        self
    }

    /// Require the (decoded) path to start with `prefix`.
    #[must_use]
    pub fn require_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = Some(prefix.into());
        self
    }

    /// Set the query parameter rule.
    #[must_use]
    pub fn query(mut self, rule: QueryRule) -> Self {
        self.query = rule;
        self
    }

    /// Permit `user:pass@` in URLs.
    #[must_use]
    pub fn allow_credentials(mut self) -> Self {
        self.allow_credentials = true;
        self
    }

    /// Attach a custom validator that runs last.
    #[must_use]
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Url) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Allowed schemes.
    pub fn protocols(&self) -> impl Iterator<Item = &str> {
        self.protocols.iter().map(String::as_str)
    }

    /// Parse and validate a URL string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PolicyViolation`] naming the first rule that failed.
    pub fn validate(&self, input: &str) -> Result<Url> {
        let url = Url::parse(input.trim())
            .map_err(|e| Error::policy(ViolationKind::InvalidUrl, format!("{e}: {input}")))?;
        self.validate_url(&url)?;
        Ok(url)
    }

    /// Validate an already-parsed URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PolicyViolation`] naming the first rule that failed.
    pub fn validate_url(&self, url: &Url) -> Result<()> {
        if !self.protocols.contains(url.scheme()) {
            return Err(Error::policy(
                ViolationKind::Protocol,
                format!("scheme '{}' is not allowed", url.scheme()),
            ));
        }

        if !self.allow_credentials && (!url.username().is_empty() || url.password().is_some()) {
            return Err(Error::policy(
                ViolationKind::Credentials,
                "credentials in URL are not allowed",
            ));
        }

        let host = url
            .host_str()
            .map(normalize_host)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::policy(ViolationKind::Host, "URL has no host"))?;
        if !self.host_allowed(&host) {
            return Err(Error::policy(
                ViolationKind::Host,
                format!("host '{host}' is not allowed"),
            ));
        }

        if self.require_default_port {
            if let Some(port) = url.port() {
                return Err(Error::policy(
                    ViolationKind::Port,
                    format!("non-default port {port} is not allowed"),
                ));
            }
        }

        self.check_path(url.path())?;
        self.check_query(url)?;

        if let Some(validator) = &self.validator {
            validator(url).map_err(|reason| Error::policy(ViolationKind::Custom, reason))?;
        }

        Ok(())
    }

    fn host_allowed(&self, host: &str) -> bool {
        if self.hosts.is_none() && self.host_suffixes.is_none() {
            return true;
        }
        let exact = self.hosts.as_ref().is_some_and(|set| set.contains(host));
        let suffix = self.host_suffixes.as_ref().is_some_and(|set| {
            set.iter().any(|domain| {
                host.strip_suffix(domain.as_str())
                    .is_some_and(|rest| rest.len() > 1 && rest.ends_with('.'))
            })
        });
        exact || suffix
    }

    fn check_path(&self, raw: &str) -> Result<()> {
        let variants = path_variants(raw)?;

        for variant in &variants {
            if has_encoded_separator(variant) {
                return Err(Error::policy(
                    ViolationKind::Path,
                    "encoded path separator is not allowed",
                ));
            }
            if has_dot_segment(variant) {
                return Err(Error::policy(
                    ViolationKind::Path,
                    "dot segments are not allowed",
                ));
            }
        }

        if let Some(prefix) = &self.path_prefix {
            let base = prefix.trim_end_matches('/');
            let matches = variants
                .iter()
                .any(|v| v == base || v.starts_with(&format!("{base}/")));
            if !matches {
                return Err(Error::policy(
                    ViolationKind::Path,
                    format!("path must start with '{prefix}'"),
                ));
            }
        }

        Ok(())
    }

    fn check_query(&self, url: &Url) -> Result<()> {
        match &self.query {
            QueryRule::AllowAll => Ok(()),
            QueryRule::AllowNone => {
                if url.query().is_some_and(|q| !q.is_empty()) {
                    Err(Error::policy(
                        ViolationKind::Query,
                        "query parameters are not allowed",
                    ))
                } else {
                    Ok(())
                }
            }
            QueryRule::AllowKeys(keys) => {
                match url.query_pairs().find(|(k, _)| !keys.contains(&**k)) {
                    Some((key, _)) => Err(Error::policy(
                        ViolationKind::Query,
                        format!("query parameter '{key}' is not allowed"),
                    )),
                    None => Ok(()),
                }
            }
        }
    }
}

/// Lowercase, drop IPv6 brackets and a trailing root dot.
pub(crate) fn normalize_host(host: &str) -> String {
    host.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

/// The raw path plus up to two successive percent-decodings.
fn path_variants(raw: &str) -> Result<Vec<String>> {
    if !is_well_formed_encoding(raw) {
        return Err(Error::policy(
            ViolationKind::Path,
            "invalid percent-encoding in path",
        ));
    }

    let mut variants = vec![raw.to_string()];
    for _ in 0..2 {
        let Some(last) = variants.last() else { break };
        let decoded = percent_decode_str(last)
            .decode_utf8()
            .map_err(|_| Error::policy(ViolationKind::Path, "path is not valid UTF-8"))?
            .into_owned();
        if &decoded == last {
            break;
        }
        variants.push(decoded);
    }
    Ok(variants)
}

fn is_well_formed_encoding(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let valid = bytes.get(i + 1).is_some_and(u8::is_ascii_hexdigit)
                && bytes.get(i + 2).is_some_and(u8::is_ascii_hexdigit);
            if !valid {
                return false;
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    true
}

fn has_encoded_separator(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    lower.contains("%2f") || lower.contains("%5c")
}

fn has_dot_segment(path: &str) -> bool {
    path.split(['/', '\\']).any(|seg| seg == "." || seg == "..")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn docs_policy() -> UrlPolicy {
        UrlPolicy::new(["https"])
            .allow_hosts(["huggingface.co"])
            .require_path_prefix("/docs/")
    }

    fn kind(err: Error) -> ViolationKind {
        match err {
            Error::PolicyViolation { kind, .. } => kind,
            other => panic!("expected policy violation, got {other:?}"),
        }
    }

    #[test]
    fn docs_url_validates() {
        let url = docs_policy()
            .validate("https://huggingface.co/docs/transformers")
            .unwrap();
        assert_eq!(url.path(), "/docs/transformers");
    }

    #[test]
    fn wrong_protocol_fails() {
        let err = docs_policy()
            .validate("http://huggingface.co/docs/transformers")
            .unwrap_err();
        assert_eq!(kind(err), ViolationKind::Protocol);
    }

    #[test]
    fn encoded_traversal_fails() {
        let err = docs_policy()
            .validate("https://huggingface.co/docs/..%2fsecret")
            .unwrap_err();
        assert_eq!(kind(err), ViolationKind::Path);
    }

    #[test]
    fn double_encoded_traversal_fails() {
        for url in [
            "https://huggingface.co/docs/%252e%252e/secret",
            "https://huggingface.co/docs/x%255csecret",
            "https://huggingface.co/docs/%2e%2e%5csecret",
        ] {
            let err = docs_policy().validate(url).unwrap_err();
            assert_eq!(kind(err), ViolationKind::Path, "{url}");
        }
    }

    #[test]
    fn foreign_host_fails() {
        let err = docs_policy().validate("https://evil.com/docs/x").unwrap_err();
        assert_eq!(kind(err), ViolationKind::Host);
    }

    #[test]
    fn invalid_percent_encoding_fails() {
        let err = docs_policy()
            .validate("https://huggingface.co/docs/%zz")
            .unwrap_err();
        assert_eq!(kind(err), ViolationKind::Path);
    }

    #[test]
    fn prefix_matches_with_or_without_trailing_slash() {
        let policy = docs_policy();
        assert!(policy.validate("https://huggingface.co/docs").is_ok());
        assert!(policy.validate("https://huggingface.co/docs/").is_ok());
        assert_eq!(
            kind(policy.validate("https://huggingface.co/docsx").unwrap_err()),
            ViolationKind::Path
        );
        assert_eq!(
            kind(policy.validate("https://huggingface.co/models").unwrap_err()),
            ViolationKind::Path
        );
    }

    #[test]
    fn credentials_rejected_unless_allowed() {
        let policy = UrlPolicy::new(["https"]);
        assert_eq!(
            kind(policy.validate("https://user:pw@example.com/").unwrap_err()),
            ViolationKind::Credentials
        );
        assert!(
            policy
                .allow_credentials()
                .validate("https://user:pw@example.com/")
                .is_ok()
        );
    }

    #[test]
    fn no_host_rule_accepts_any_host() {
        let policy = UrlPolicy::new(["http", "https"]);
        assert!(policy.validate("http://anything.example:8080/a?b=c").is_ok());
    }

    #[test]
    fn subdomain_rule_is_strict() {
        let policy = UrlPolicy::new(["https"]).allow_subdomains_of(["hf.space"]);
        assert!(policy.validate("https://my-app.hf.space/").is_ok());
        assert!(policy.validate("https://HF-App.HF.space./").is_ok());
        assert_eq!(
            kind(policy.validate("https://hf.space/").unwrap_err()),
            ViolationKind::Host
        );
        assert_eq!(
            kind(policy.validate("https://evilhf.space/").unwrap_err()),
            ViolationKind::Host
        );
    }

    #[test]
    fn default_port_requirement() {
        let policy = UrlPolicy::new(["https"]).require_default_port();
        assert!(policy.validate("https://example.com/").is_ok());
        assert!(policy.validate("https://example.com:443/").is_ok());
        assert_eq!(
            kind(policy.validate("https://example.com:8443/").unwrap_err()),
            ViolationKind::Port
        );
    }

    #[test]
    fn query_rules() {
        let none = UrlPolicy::new(["https"]).query(QueryRule::AllowNone);
        assert!(none.validate("https://example.com/a").is_ok());
        assert_eq!(
            kind(none.validate("https://example.com/a?x=1").unwrap_err()),
            ViolationKind::Query
        );

        let keyed = UrlPolicy::new(["https"])
            .query(QueryRule::AllowKeys(BTreeSet::from(["session_id".to_string()])));
        assert!(keyed.validate("https://example.com/a?session_id=1").is_ok());
        assert_eq!(
            kind(keyed.validate("https://example.com/a?session_id=1&x=2").unwrap_err()),
            ViolationKind::Query
        );
    }

    #[test]
    fn custom_validator_runs_last() {
        let policy = UrlPolicy::new(["https"]).with_validator(|url| {
            if url.path().contains("admin") {
                Err("admin paths are off limits".to_string())
            } else {
                Ok(())
            }
        });
        assert!(policy.validate("https://example.com/ok").is_ok());
        assert_eq!(
            kind(policy.validate("https://example.com/admin").unwrap_err()),
            ViolationKind::Custom
        );
        // Earlier rules win over the custom validator
        assert_eq!(
            kind(policy.validate("ftp://example.com/admin").unwrap_err()),
            ViolationKind::Protocol
        );
    }

    #[test]
    fn unparsable_url_is_invalid() {
        assert_eq!(
            kind(UrlPolicy::new(["https"]).validate("not a url").unwrap_err()),
            ViolationKind::InvalidUrl
        );
    }

    #[test]
    fn ipv6_hosts_compare_without_brackets() {
        let policy = UrlPolicy::new(["http"]).allow_hosts(["::1"]);
        assert!(policy.validate("http://[::1]:8080/").is_ok());
    }
}
