//! Core data types.
//!
//! Upstream registry records arrive as nested JSON; this module gives each
//! external shape an explicit record type plus a converter to the flat rows
//! the store persists. It also defines the enrichment/extraction failure
//! taxonomy shared by every worker.

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

// ============ Upstream registry shapes ============

/// One page of the upstream registry listing.
#[derive(Debug, Deserialize)]
pub struct RegistryPage {
    #[serde(default)]
    pub servers: Vec<RegistryEntry>,
    #[serde(default)]
    pub metadata: RegistryPageMeta,
}

#[derive(Debug, Default, Deserialize)]
pub struct RegistryPageMeta {
    #[serde(rename = "nextCursor")]
    pub next_cursor: Option<String>,
}

/// A single server entry as returned by the registry.
#[derive(Debug, Deserialize)]
pub struct RegistryEntry {
    #[serde(default)]
    pub server: ServerDetail,
    #[serde(rename = "_meta", default)]
    pub meta: EntryMeta,
}

#[derive(Debug, Default, Deserialize)]
pub struct EntryMeta {
    #[serde(rename = "io.modelcontextprotocol.registry/official", default)]
    pub official: OfficialMeta,
}

#[derive(Debug, Default, Deserialize)]
pub struct OfficialMeta {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(rename = "publishedAt", default)]
    pub published_at: Option<String>,
    #[serde(rename = "updatedAt", default)]
    pub updated_at: Option<String>,
    #[serde(rename = "isLatest", default)]
    pub is_latest: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ServerDetail {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub repository: Option<RepositoryDetail>,
    #[serde(rename = "websiteUrl", default)]
    pub website_url: Option<String>,
    #[serde(default)]
    pub packages: Vec<PackageDetail>,
    #[serde(default)]
    pub remotes: Vec<RemoteDetail>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RepositoryDetail {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PackageDetail {
    #[serde(rename = "registryType", default)]
    pub registry_type: Option<String>,
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub transport: Option<TransportDetail>,
    #[serde(rename = "runtimeHint", default)]
    pub runtime_hint: Option<String>,
    #[serde(rename = "environmentVariables", default)]
    pub environment_variables: Vec<EnvVarDetail>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TransportDetail {
    #[serde(rename = "type", default)]
    pub transport_type: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RemoteDetail {
    #[serde(rename = "type", default)]
    pub transport_type: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    /// Registry publishes headers as a list of `{name, value}` objects.
    #[serde(default)]
    pub headers: Vec<HeaderDetail>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HeaderDetail {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EnvVarDetail {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "isRequired", default)]
    pub is_required: bool,
    #[serde(rename = "isSecret", default)]
    pub is_secret: bool,
}

impl RemoteDetail {
    /// Flatten the header list into the on-disk mapping shape. Placeholder
    /// values (`ENV:NAME`, `${NAME}`) are kept verbatim; they resolve at
    /// invocation time.
    pub fn headers_map(&self) -> BTreeMap<String, String> {
        self.headers
            .iter()
            .filter(|h| !h.name.is_empty())
            .map(|h| (h.name.clone(), h.value.clone().unwrap_or_default()))
            .collect()
    }
}

// ============ GitHub repository metadata ============

/// The subset of the GitHub repos API response the scorers consume.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GitHubRepo {
    #[serde(default)]
    pub stargazers_count: i64,
    #[serde(default)]
    pub forks_count: i64,
    #[serde(default)]
    pub open_issues_count: i64,
    #[serde(default)]
    pub watchers_count: i64,
    #[serde(default)]
    pub subscribers_count: i64,
    #[serde(default)]
    pub pushed_at: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub license: Option<GitHubLicense>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub fork: bool,
    #[serde(default)]
    pub default_branch: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GitHubLicense {
    #[serde(default)]
    pub spdx_id: Option<String>,
}

/// Parse `owner/repo` out of a repository URL. Returns `None` for anything
/// that is not a github.com repo path.
pub fn parse_github_repo(url: &str) -> Option<(String, String)> {
    let rest = url
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_start_matches("www.")
        .strip_prefix("github.com/")?;

    let mut parts = rest.split('/').filter(|p| !p.is_empty());
    let owner = parts.next()?;
    let repo = parts.next()?.trim_end_matches(".git");

    if owner.is_empty() || repo.is_empty() {
        return None;
    }
    Some((owner.to_string(), repo.to_string()))
}

// ============ Failure taxonomy ============

/// Classification of an enrichment or extraction failure.
///
/// `Auth` persists as a permanent failure: a 401/403 will not clear without
/// operator action, and `--clean` is the retry path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Permanent(&'static str),
    Auth(&'static str),
    Transient(&'static str),
}

impl FailureClass {
    /// The value written to the `status` column.
    pub fn status(&self) -> &'static str {
        match self {
            FailureClass::Permanent(_) | FailureClass::Auth(_) => "permanent_failure",
            FailureClass::Transient(_) => "transient_failure",
        }
    }

    /// The value written to the `failure_reason` column.
    pub fn reason(&self) -> &'static str {
        match self {
            FailureClass::Permanent(r) | FailureClass::Auth(r) | FailureClass::Transient(r) => r,
        }
    }
}

/// Classify a failure message.
///
/// Matching is substring-based over the lowercased message; the HTTP status
/// code is only visible when the caller folded it into the message. Pattern
/// order matters: permanent identity errors first, then auth, then
/// environment errors, then transient network conditions, then protocol
/// breakage, with `unknown_error` as the transient default.
pub fn classify_failure(message: &str) -> FailureClass {
    let lower = message.to_lowercase();

    let permanent: &[(&str, &str)] = &[
        ("404", "not_found"),
        ("package not found", "package_not_found"),
        ("could not determine executable", "no_executable"),
        ("no executable", "no_executable"),
        ("no such file or directory", "no_executable"),
        ("not found", "not_found"),
        ("invalid url", "invalid_url"),
        ("relative url without a base", "invalid_url"),
    ];
    for (pattern, reason) in permanent {
        if lower.contains(pattern) {
            return FailureClass::Permanent(reason);
        }
    }

    let auth: &[&str] = &[
        "401",
        "403",
        "unauthorized",
        "forbidden",
        "authentication required",
    ];
    for pattern in auth {
        if lower.contains(pattern) {
            return FailureClass::Auth("auth_required");
        }
    }

    // Docker daemon absence reads as permanent: the batch host does not run
    // Docker, and --clean is the retry path if that ever changes.
    for pattern in ["docker", "container", "daemon"] {
        if lower.contains(pattern) {
            return FailureClass::Permanent("docker_not_running");
        }
    }

    let transient: &[(&str, &str)] = &[
        ("timed out", "timeout"),
        ("timeout", "timeout"),
        ("deadline", "timeout"),
        ("connection refused", "connection_refused"),
        ("connection reset", "connection_refused"),
        ("rate limit", "rate_limited"),
        ("429", "rate_limited"),
        ("500", "server_error_5xx"),
        ("502", "server_error_5xx"),
        ("503", "server_error_5xx"),
        ("504", "server_error_5xx"),
        ("server error", "server_error_5xx"),
    ];
    for (pattern, reason) in transient {
        if lower.contains(pattern) {
            return FailureClass::Transient(reason);
        }
    }

    // Protocol-level breakage means the server implementation is broken;
    // retrying will not fix it.
    let protocol: &[(&str, &str)] = &[
        ("protocol error", "mcp_protocol_error"),
        ("unexpected message", "mcp_response_error"),
        ("unexpected response", "mcp_response_error"),
        ("expect initialized response", "mcp_response_error"),
        ("invalid json", "mcp_invalid_response"),
        ("json decode", "mcp_invalid_response"),
        ("deserialize", "mcp_invalid_response"),
        ("sdk error", "mcp_sdk_error"),
    ];
    for (pattern, reason) in protocol {
        if lower.contains(pattern) {
            return FailureClass::Permanent(reason);
        }
    }

    FailureClass::Transient("unknown_error")
}

/// Normalise a repository URL for cross-registry matching: scheme and
/// `www.` stripped, lowercased, trailing `/` and `.git` removed.
pub fn normalize_repo_url(url: &str) -> String {
    url.trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_start_matches("www.")
        .trim_end_matches('/')
        .trim_end_matches(".git")
        .to_lowercase()
}

/// Extract a JSON string field, treating `null` and missing as `None`.
pub fn json_str(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_github_repo() {
        assert_eq!(
            parse_github_repo("https://github.com/acme/tool"),
            Some(("acme".to_string(), "tool".to_string()))
        );
        assert_eq!(
            parse_github_repo("http://www.github.com/acme/tool.git"),
            Some(("acme".to_string(), "tool".to_string()))
        );
        assert_eq!(
            parse_github_repo("https://github.com/acme/tool/tree/main/sub"),
            Some(("acme".to_string(), "tool".to_string()))
        );
        assert_eq!(parse_github_repo("https://gitlab.com/acme/tool"), None);
        assert_eq!(parse_github_repo("https://github.com/"), None);
    }

    #[test]
    fn test_classify_permanent() {
        assert_eq!(
            classify_failure("HTTP 404 fetching repo"),
            FailureClass::Permanent("not_found")
        );
        assert_eq!(
            classify_failure("npm ERR! package not found"),
            FailureClass::Permanent("package_not_found")
        );
        assert_eq!(
            classify_failure("invalid URL scheme"),
            FailureClass::Permanent("invalid_url")
        );
    }

    #[test]
    fn test_classify_auth_is_permanent_status() {
        let class = classify_failure("HTTP 403 Forbidden");
        assert_eq!(class, FailureClass::Auth("auth_required"));
        assert_eq!(class.status(), "permanent_failure");
    }

    #[test]
    fn test_classify_docker_permanent() {
        let class = classify_failure("Cannot connect to the Docker daemon");
        assert_eq!(class, FailureClass::Permanent("docker_not_running"));
    }

    #[test]
    fn test_classify_transient() {
        assert_eq!(
            classify_failure("operation timed out after 30s"),
            FailureClass::Transient("timeout")
        );
        assert_eq!(
            classify_failure("connection refused"),
            FailureClass::Transient("connection_refused")
        );
        assert_eq!(
            classify_failure("HTTP 429 too many requests"),
            FailureClass::Transient("rate_limited")
        );
        assert_eq!(
            classify_failure("HTTP 503 service unavailable"),
            FailureClass::Transient("server_error_5xx")
        );
    }

    #[test]
    fn test_classify_unknown_defaults_transient() {
        let class = classify_failure("something inexplicable happened");
        assert_eq!(class, FailureClass::Transient("unknown_error"));
        assert_eq!(class.status(), "transient_failure");
    }

    #[test]
    fn test_classify_protocol_permanent() {
        assert_eq!(
            classify_failure("stream closed: protocol error"),
            FailureClass::Permanent("mcp_protocol_error")
        );
    }

    #[test]
    fn test_normalize_repo_url() {
        assert_eq!(
            normalize_repo_url("https://GitHub.com/Acme/Tool.git"),
            "github.com/acme/tool"
        );
        assert_eq!(
            normalize_repo_url("http://github.com/acme/tool/"),
            "github.com/acme/tool"
        );
    }

    #[test]
    fn test_headers_map_flattens_list() {
        let remote = RemoteDetail {
            transport_type: Some("streamable-http".to_string()),
            url: Some("https://x/mcp".to_string()),
            headers: vec![
                HeaderDetail {
                    name: "Authorization".to_string(),
                    value: Some("Bearer ${TOK}".to_string()),
                },
                HeaderDetail {
                    name: String::new(),
                    value: Some("dropped".to_string()),
                },
            ],
        };
        let map = remote.headers_map();
        assert_eq!(map.len(), 1);
        assert_eq!(map["Authorization"], "Bearer ${TOK}");
    }
}
