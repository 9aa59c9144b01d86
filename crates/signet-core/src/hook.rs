//! Request interception hook.
//!
//! The proxy engine invokes a single hook with every parsed request before
//! it is forwarded. The production hook is [`BearerInjector`], which sets
//! the `Authorization` header on requests bound for a configured API host.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::message::Request;

/// A pluggable request-inspection hook.
///
/// Implementations must restrict themselves to the header map: the method
/// and target of the request are off-limits. Hooks have no error channel;
/// an implementation that cannot decide leaves the request unchanged.
pub trait RequestHook: Send + Sync {
    /// Inspects and possibly mutates the request headers before forwarding.
    fn apply(&self, req: &mut Request);
}

/// How requests are matched against the configured host pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchPolicy {
    /// The pattern matches if it occurs anywhere in the assembled URL, and
    /// an exclusion suppresses injection if it occurs anywhere in the URL.
    /// This reproduces the permissive containment behavior of the original
    /// deployment and may match unintended subdomains or paths.
    Substring,
    /// The pattern must equal the request host or be a parent domain of it,
    /// and exclusions are matched as path prefixes.
    Exact,
}

impl FromStr for MatchPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "substring" => Ok(MatchPolicy::Substring),
            "exact" => Ok(MatchPolicy::Exact),
            other => Err(format!(
                "unknown match policy {other:?}, expected \"substring\" or \"exact\""
            )),
        }
    }
}

impl fmt::Display for MatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchPolicy::Substring => f.write_str("substring"),
            MatchPolicy::Exact => f.write_str("exact"),
        }
    }
}

/// Injects `Authorization: Bearer <token>` into matching requests.
///
/// A request matches when its target agrees with the host pattern under the
/// configured [`MatchPolicy`] and none of the exclusions apply. Everything
/// else passes through untouched.
#[derive(Clone)]
pub struct BearerInjector {
    token: String,
    host_pattern: String,
    exclude: Vec<String>,
    policy: MatchPolicy,
}

impl fmt::Debug for BearerInjector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The token is a credential; never log it.
        f.debug_struct("BearerInjector")
            .field("host_pattern", &self.host_pattern)
            .field("exclude", &self.exclude)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl BearerInjector {
    /// Creates an injector with the default exclusion list (`oauth2`, the
    /// token-exchange endpoint) and substring matching.
    pub fn new(token: impl Into<String>, host_pattern: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            host_pattern: host_pattern.into(),
            exclude: vec!["oauth2".to_string()],
            policy: MatchPolicy::Substring,
        }
    }

    /// Replaces the exclusion list.
    pub fn with_exclude(mut self, exclude: Vec<String>) -> Self {
        self.exclude = exclude;
        self
    }

    /// Sets the match policy.
    pub fn with_policy(mut self, policy: MatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn matches(&self, req: &Request) -> bool {
        match self.policy {
            MatchPolicy::Substring => {
                let url = req.url();
                url.contains(&self.host_pattern) && !self.exclude.iter().any(|e| url.contains(e))
            }
            MatchPolicy::Exact => {
                let host = req.host();
                let host_ok = host == self.host_pattern
                    || host
                        .strip_suffix(&self.host_pattern)
                        .is_some_and(|prefix| prefix.ends_with('.'));
                host_ok
                    && !self.exclude.iter().any(|e| {
                        let prefix = if e.starts_with('/') {
                            e.clone()
                        } else {
                            format!("/{e}")
                        };
                        req.path().starts_with(&prefix)
                    })
            }
        }
    }
}

impl RequestHook for BearerInjector {
    fn apply(&self, req: &mut Request) {
        if !self.matches(req) {
            return;
        }
        tracing::debug!(host = req.host(), path = req.path(), "injecting bearer token");
        req.headers
            .set("Authorization", format!("Bearer {}", self.token));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::HeaderMap;
    use crate::message::{BodyFraming, Method, Scheme, Target, Version};

    fn request(host: &str, path_and_query: &str) -> Request {
        Request {
            method: Method::Get,
            target: Target::new(Scheme::Https, host, 443, path_and_query),
            version: Version::Http11,
            headers: HeaderMap::new(),
            framing: BodyFraming::None,
        }
    }

    #[test]
    fn injects_on_matching_host() {
        let hook = BearerInjector::new("abc123", "googleapis.com");
        let mut req = request("storage.googleapis.com", "/v1/data");
        hook.apply(&mut req);
        assert_eq!(req.headers.get("Authorization"), Some("Bearer abc123"));
    }

    #[test]
    fn overwrites_existing_authorization() {
        let hook = BearerInjector::new("abc123", "googleapis.com");
        let mut req = request("storage.googleapis.com", "/v1/data");
        req.headers.append("Authorization", "Bearer stale");
        req.headers.append("authorization", "Basic dXNlcg==");
        hook.apply(&mut req);

        let values: Vec<&str> = req.headers.get_all("authorization").collect();
        assert_eq!(values, vec!["Bearer abc123"]);
    }

    #[test]
    fn leaves_other_hosts_untouched() {
        let hook = BearerInjector::new("abc123", "googleapis.com");
        let mut req = request("other.com", "/resource");
        req.headers.append("X-Existing", "yes");
        let before = req.clone();
        hook.apply(&mut req);
        assert_eq!(req, before);
    }

    #[test]
    fn excluded_path_is_untouched() {
        let hook = BearerInjector::new("abc123", "googleapis.com");
        let mut req = request("www.googleapis.com", "/oauth2/token");
        let before = req.clone();
        hook.apply(&mut req);
        assert_eq!(req, before);
    }

    #[test]
    fn substring_policy_matches_anywhere_in_url() {
        // The permissive policy also fires when the pattern occurs in the
        // path rather than the host, matching the original deployment.
        let hook = BearerInjector::new("t", "googleapis.com");
        let mut req = request("evil.example.com", "/googleapis.com/phish");
        hook.apply(&mut req);
        assert!(req.headers.contains("Authorization"));
    }

    #[test]
    fn exact_policy_requires_host_match() {
        let hook =
            BearerInjector::new("t", "googleapis.com").with_policy(MatchPolicy::Exact);

        let mut req = request("evil.example.com", "/googleapis.com/phish");
        hook.apply(&mut req);
        assert!(!req.headers.contains("Authorization"));

        let mut req = request("storage.googleapis.com", "/v1/data");
        hook.apply(&mut req);
        assert!(req.headers.contains("Authorization"));

        // Suffix match must be on a label boundary
        let mut req = request("evilgoogleapis.com", "/v1/data");
        hook.apply(&mut req);
        assert!(!req.headers.contains("Authorization"));
    }

    #[test]
    fn exact_policy_excludes_path_prefixes() {
        let hook = BearerInjector::new("t", "googleapis.com")
            .with_policy(MatchPolicy::Exact)
            .with_exclude(vec!["oauth2".to_string()]);

        let mut req = request("googleapis.com", "/oauth2/token");
        hook.apply(&mut req);
        assert!(!req.headers.contains("Authorization"));

        let mut req = request("googleapis.com", "/v1/oauth2ish");
        hook.apply(&mut req);
        assert!(req.headers.contains("Authorization"));
    }

    #[test]
    fn hook_never_touches_method_or_target() {
        let hook = BearerInjector::new("abc123", "googleapis.com");
        let mut req = request("www.googleapis.com", "/v1/data");
        let method = req.method.clone();
        let target = req.target.clone();
        hook.apply(&mut req);
        assert_eq!(req.method, method);
        assert_eq!(req.target, target);
    }

    #[test]
    fn match_policy_parses_and_serializes() {
        assert_eq!("substring".parse::<MatchPolicy>().unwrap(), MatchPolicy::Substring);
        assert_eq!("exact".parse::<MatchPolicy>().unwrap(), MatchPolicy::Exact);
        assert!("fuzzy".parse::<MatchPolicy>().is_err());

        let json = serde_json::to_string(&MatchPolicy::Exact).unwrap();
        assert_eq!(json, "\"exact\"");
    }

    #[test]
    fn debug_output_hides_token() {
        let hook = BearerInjector::new("super-secret", "googleapis.com");
        let debug = format!("{hook:?}");
        assert!(!debug.contains("super-secret"));
    }
}
