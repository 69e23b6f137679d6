//! Scope matching and URL helpers.
//!
//! A policy scope is a domain, optionally with scheme and port (`example.com`,
//! `https://example.com:8443`). A scope covers every host equal to its host or below it
//! on a label boundary, so `shop.example.com` is covered by `example.com` but
//! `evilexample.com` is not.

use url::Url;

/// Parses a scope or visited-site string into a URL, prefixing `http://` (or `https://`
/// when `secure` is set) when no scheme is present.
pub fn check_url(input: &str, secure: bool) -> Option<Url> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    if input.contains("://") {
        return Url::parse(input).ok();
    }

    let scheme = if secure { "https" } else { "http" };
    Url::parse(&format!("{scheme}://{input}")).ok()
}

/// Returns true when `host` equals `domain` or is a subdomain of it.
///
/// Both sides are compared case-insensitively and a leading dot on `domain` is ignored.
pub fn domain_matches(host: &str, domain: &str) -> bool {
    let domain = domain.trim_start_matches('.');
    if host.is_empty() || domain.is_empty() {
        return false;
    }

    let host = host.to_ascii_lowercase();
    let domain = domain.to_ascii_lowercase();

    host == domain || host.ends_with(&format!(".{domain}"))
}

/// Returns true when the policy `scope` covers the `visited` URL.
///
/// The host must match on a label boundary, and when the scope names a port the visited
/// URL must use the same one.
pub fn matches_scope(visited: &Url, scope: &Url) -> bool {
    let (Some(host), Some(scope_host)) = (visited.host_str(), scope.host_str()) else {
        return false;
    };

    if !domain_matches(host, scope_host) {
        return false;
    }

    match scope.port() {
        None => true,
        Some(port) => visited.port() == Some(port),
    }
}

/// Key under which policy items are stored: the ascii origin of the visited page.
pub fn origin_key(url: &Url) -> String {
    url.origin().ascii_serialization()
}

/// Only web pages take part in policy negotiation.
pub fn is_web_url(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https") && url.host_str().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        check_url(s, false).unwrap()
    }

    #[test]
    fn subdomains_are_covered() {
        assert!(matches_scope(&url("shop.example.com"), &url("example.com")));
        assert!(matches_scope(&url("https://example.com/path"), &url("example.com")));
    }

    #[test]
    fn suffix_without_label_boundary_is_not_covered() {
        assert!(!matches_scope(&url("evilexample.com"), &url("example.com")));
        assert!(!matches_scope(&url("example.com"), &url("shop.example.com")));
    }

    #[test]
    fn scope_port_must_match() {
        assert!(!matches_scope(&url("example.com:443"), &url("example.com:8443")));
        assert!(matches_scope(&url("example.com:8443"), &url("example.com:8443")));
        assert!(matches_scope(&url("example.com:9000"), &url("example.com")));
    }

    #[test]
    fn check_url_prefixes_scheme() {
        assert_eq!(check_url("example.com", false).unwrap().scheme(), "http");
        assert_eq!(check_url("example.com", true).unwrap().scheme(), "https");
        assert_eq!(check_url("ftp://example.com", true).unwrap().scheme(), "ftp");
        assert!(check_url("   ", false).is_none());
    }

    #[test]
    fn domain_matching_ignores_leading_dot_and_case() {
        assert!(domain_matches("ads.Example.com", ".example.COM"));
        assert!(!domain_matches("example.com", ""));
    }

    #[test]
    fn origin_key_drops_path_and_default_port() {
        let u = Url::parse("https://www.example.com:443/a/b?c=d").unwrap();
        assert_eq!(origin_key(&u), "https://www.example.com");
        assert!(is_web_url(&u));
        assert!(!is_web_url(&Url::parse("about:blank").unwrap()));
    }
}
