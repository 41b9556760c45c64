//! Request classification.
//!
//! Classification is a pure function of method, URL and request mode; the
//! first matching rule wins:
//!
//! 1. auth passthrough (network first, never written)
//! 2. data revalidate (stale-while-revalidate, marked when served from cache)
//! 3. static cache-first
//! 4. navigation fallback
//! 5. unhandled

use http::Method;
use novira_core::{RequestMode, RouteRules};
use novira_net::Request;
use url::Url;

/// Routing policy for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoutePolicy {
    AuthPassthrough,
    DataRevalidate,
    StaticCacheFirst,
    NavigationFallback,
    Unhandled,
}

impl RoutePolicy {
    /// Short name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthPassthrough => "auth-passthrough",
            Self::DataRevalidate => "data-revalidate",
            Self::StaticCacheFirst => "static-cache-first",
            Self::NavigationFallback => "navigation-fallback",
            Self::Unhandled => "unhandled",
        }
    }
}

impl std::fmt::Display for RoutePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Part of the URL a pattern looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternType {
    /// Host contains substring.
    HostContains,
    /// Path contains substring.
    PathContains,
    /// Path starts with prefix.
    PathPrefix,
    /// Last path segment ends with `.<ext>`.
    Extension,
    /// Scheme equals.
    Scheme,
}

/// URL pattern for matching.
#[derive(Debug, Clone)]
pub struct UrlPattern {
    pub pattern_type: PatternType,
    pub pattern: String,
}

impl UrlPattern {
    pub fn host_contains(marker: &str) -> Self {
        Self::new(PatternType::HostContains, marker)
    }

    pub fn path_contains(marker: &str) -> Self {
        Self::new(PatternType::PathContains, marker)
    }

    pub fn path_prefix(prefix: &str) -> Self {
        Self::new(PatternType::PathPrefix, prefix)
    }

    pub fn extension(ext: &str) -> Self {
        Self::new(PatternType::Extension, ext.trim_start_matches('.'))
    }

    pub fn scheme(scheme: &str) -> Self {
        Self::new(PatternType::Scheme, scheme)
    }

    fn new(pattern_type: PatternType, pattern: &str) -> Self {
        Self {
            pattern_type,
            pattern: pattern.to_string(),
        }
    }

    /// Check if a URL matches this pattern.
    pub fn matches(&self, url: &Url) -> bool {
        match self.pattern_type {
            PatternType::HostContains => url
                .host_str()
                .is_some_and(|host| host.contains(&self.pattern)),
            PatternType::PathContains => url.path().contains(&self.pattern),
            PatternType::PathPrefix => url.path().starts_with(&self.pattern),
            PatternType::Extension => url
                .path()
                .rsplit_once('.')
                .is_some_and(|(_, ext)| ext == self.pattern),
            PatternType::Scheme => url.scheme() == self.pattern,
        }
    }
}

/// Compiled form of [`RouteRules`].
#[derive(Debug, Clone)]
pub struct RouteClassifier {
    passthrough: Vec<UrlPattern>,
    auth_host: UrlPattern,
    auth_path: UrlPattern,
    data: Vec<UrlPattern>,
    statics: Vec<UrlPattern>,
}

impl RouteClassifier {
    pub fn new(rules: &RouteRules) -> Self {
        let statics = rules
            .static_prefixes
            .iter()
            .map(|p| UrlPattern::path_prefix(p))
            .chain(rules.static_extensions.iter().map(|e| UrlPattern::extension(e)))
            .collect();

        Self {
            passthrough: rules
                .passthrough_schemes
                .iter()
                .map(|s| UrlPattern::scheme(s))
                .collect(),
            auth_host: UrlPattern::host_contains(&rules.auth_host),
            auth_path: UrlPattern::path_contains(&rules.auth_path),
            data: rules
                .data_hosts
                .iter()
                .map(|h| UrlPattern::host_contains(h))
                .collect(),
            statics,
        }
    }

    /// Classify a request.
    pub fn classify_request(&self, request: &Request) -> RoutePolicy {
        self.classify(&request.method, &request.url, request.mode)
    }

    /// Classify by method, URL and mode.
    pub fn classify(&self, method: &Method, url: &Url, mode: RequestMode) -> RoutePolicy {
        if method != Method::GET {
            return RoutePolicy::Unhandled;
        }
        if self.passthrough.iter().any(|p| p.matches(url)) {
            return RoutePolicy::Unhandled;
        }
        if self.auth_host.matches(url) && self.auth_path.matches(url) {
            return RoutePolicy::AuthPassthrough;
        }
        if self.data.iter().any(|p| p.matches(url)) {
            return RoutePolicy::DataRevalidate;
        }
        if self.statics.iter().any(|p| p.matches(url)) {
            return RoutePolicy::StaticCacheFirst;
        }
        if mode == RequestMode::Navigate {
            return RoutePolicy::NavigationFallback;
        }
        RoutePolicy::Unhandled
    }
}

impl Default for RouteClassifier {
    fn default() -> Self {
        Self::new(&RouteRules::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(method: Method, url: &str, mode: RequestMode) -> RoutePolicy {
        RouteClassifier::default().classify(&method, &Url::parse(url).unwrap(), mode)
    }

    fn get(url: &str) -> RoutePolicy {
        classify(Method::GET, url, RequestMode::Cors)
    }

    #[test]
    fn test_auth_path() {
        assert_eq!(
            get("https://abc.supabase.co/auth/v1/token?grant_type=refresh_token"),
            RoutePolicy::AuthPassthrough
        );
    }

    #[test]
    fn test_auth_path_on_other_host_is_not_auth() {
        assert_eq!(get("https://example.com/auth/v1/user"), RoutePolicy::Unhandled);
    }

    #[test]
    fn test_data_hosts() {
        assert_eq!(
            get("https://abc.supabase.co/rest/v1/transactions?select=*"),
            RoutePolicy::DataRevalidate
        );
        assert_eq!(
            get("https://api.frankfurter.app/latest?from=USD"),
            RoutePolicy::DataRevalidate
        );
    }

    #[test]
    fn test_static_assets() {
        assert_eq!(
            get("https://app.test/_next/static/chunks/main-abc.js"),
            RoutePolicy::StaticCacheFirst
        );
        assert_eq!(
            get("https://app.test/_next/image?url=%2Flogo.png&w=64"),
            RoutePolicy::StaticCacheFirst
        );
        assert_eq!(get("https://app.test/Novira.png"), RoutePolicy::StaticCacheFirst);
        assert_eq!(get("https://cdn.test/font.woff2"), RoutePolicy::StaticCacheFirst);
    }

    #[test]
    fn test_extension_must_end_path() {
        assert_eq!(get("https://app.test/file.js.map"), RoutePolicy::Unhandled);
        assert_eq!(get("https://app.test/styles.css/"), RoutePolicy::Unhandled);
    }

    #[test]
    fn test_data_wins_over_static_extension() {
        assert_eq!(
            get("https://abc.supabase.co/storage/v1/object/public/avatars/me.png"),
            RoutePolicy::DataRevalidate
        );
    }

    #[test]
    fn test_navigation() {
        assert_eq!(
            classify(Method::GET, "https://app.test/analytics", RequestMode::Navigate),
            RoutePolicy::NavigationFallback
        );
        assert_eq!(get("https://app.test/analytics"), RoutePolicy::Unhandled);
    }

    #[test]
    fn test_non_get_is_unhandled() {
        for method in [Method::POST, Method::PUT, Method::PATCH, Method::DELETE] {
            assert_eq!(
                classify(method, "https://abc.supabase.co/rest/v1/transactions", RequestMode::Cors),
                RoutePolicy::Unhandled
            );
        }
        assert_eq!(
            classify(Method::POST, "https://app.test/", RequestMode::Navigate),
            RoutePolicy::Unhandled
        );
    }

    #[test]
    fn test_websockets_are_unhandled() {
        assert_eq!(
            get("wss://abc.supabase.co/realtime/v1/websocket?vsn=1.0.0"),
            RoutePolicy::Unhandled
        );
        assert_eq!(get("ws://localhost:3000/_next/webpack-hmr"), RoutePolicy::Unhandled);
    }

    #[test]
    fn test_custom_rules() {
        let rules = RouteRules {
            data_hosts: vec!["api.example.org".to_string()],
            ..Default::default()
        };
        let classifier = RouteClassifier::new(&rules);
        let url = Url::parse("https://api.example.org/v2/rates").unwrap();
        assert_eq!(
            classifier.classify(&Method::GET, &url, RequestMode::Cors),
            RoutePolicy::DataRevalidate
        );
        let url = Url::parse("https://api.frankfurter.app/latest").unwrap();
        assert_eq!(
            classifier.classify(&Method::GET, &url, RequestMode::Cors),
            RoutePolicy::Unhandled
        );
    }
}
