use crate::ScreenshotError;
use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use url::{Host, Url};

/// Pseudo-protocols refused at the start of a URL or of any path segment,
/// query value or fragment
const DANGEROUS_PROTOCOLS: &[&str] = &["javascript:", "data:", "vbscript:", "file:", "blob:"];

/// Characters after which an embedded scheme can start
const PROTOCOL_BOUNDARIES: &[char] = &['=', '/', '?', '&', '#'];

/// Gatekeeper for URLs that the capture engine is allowed to visit
///
/// Only public http(s) hosts pass. Loopback, private, link-local and
/// unspecified addresses are refused, as are well known URL shorteners whose
/// target cannot be checked up front.
pub struct UrlValidator {
    pub blocked_domains: HashSet<String>,
}

impl UrlValidator {
    pub fn new() -> Self {
        let mut blocked_domains = HashSet::new();

        // URL shorteners
        for domain in [
            "bit.ly",
            "tinyurl.com",
            "t.co",
            "goo.gl",
            "ow.ly",
            "is.gd",
            "buff.ly",
            "rebrand.ly",
            "cutt.ly",
            "shorturl.at",
            "tiny.cc",
        ] {
            blocked_domains.insert(domain.to_string());
        }

        Self { blocked_domains }
    }

    pub fn validate(&self, input: &str) -> Result<Url, ScreenshotError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ScreenshotError::InvalidUrl("URL is empty".to_string()));
        }

        let lowered = trimmed.to_lowercase();
        if let Some(protocol) = DANGEROUS_PROTOCOLS
            .iter()
            .find(|p| contains_protocol(&lowered, p))
        {
            return Err(ScreenshotError::BlockedUrl(format!(
                "contains forbidden protocol '{protocol}'"
            )));
        }

        let parsed = Url::parse(trimmed)
            .map_err(|e| ScreenshotError::InvalidUrl(format!("{trimmed}: {e}")))?;

        match parsed.scheme() {
            "http" | "https" => {}
            other => {
                return Err(ScreenshotError::BlockedUrl(format!(
                    "scheme '{other}' is not supported"
                )))
            }
        }

        match parsed.host() {
            None => Err(ScreenshotError::InvalidUrl(format!("{trimmed}: missing host"))),
            Some(Host::Ipv4(addr)) if is_restricted_ipv4(&addr) => Err(
                ScreenshotError::BlockedUrl(format!("address {addr} is not publicly routable")),
            ),
            Some(Host::Ipv6(addr)) if is_restricted_ipv6(&addr) => Err(
                ScreenshotError::BlockedUrl(format!("address {addr} is not publicly routable")),
            ),
            Some(Host::Domain(domain)) => {
                let domain = domain.trim_end_matches('.');
                if domain == "localhost" || domain.ends_with(".localhost") {
                    return Err(ScreenshotError::BlockedUrl(format!(
                        "host {domain} is not publicly routable"
                    )));
                }
                if self.is_blocked_domain(domain) {
                    return Err(ScreenshotError::BlockedUrl(format!(
                        "URL shortener {domain} is not allowed"
                    )));
                }
                Ok(parsed)
            }
            Some(_) => Ok(parsed),
        }
    }

    fn is_blocked_domain(&self, domain: &str) -> bool {
        self.blocked_domains.iter().any(|blocked| {
            domain == blocked
                || domain
                    .strip_suffix(blocked.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }

    pub fn add_blocked_domain(&mut self, domain: String) {
        self.blocked_domains.insert(domain.to_lowercase());
    }
}

impl Default for UrlValidator {
    fn default() -> Self {
        Self::new()
    }
}

fn is_restricted_ipv4(addr: &Ipv4Addr) -> bool {
    addr.is_loopback()
        || addr.is_private()
        || addr.is_link_local()
        || addr.is_unspecified()
        || addr.is_broadcast()
        // 100.64.0.0/10 carrier-grade NAT
        || (addr.octets()[0] == 100 && (addr.octets()[1] & 0xc0) == 64)
}

fn is_restricted_ipv6(addr: &Ipv6Addr) -> bool {
    if let Some(mapped) = addr.to_ipv4_mapped() {
        return is_restricted_ipv4(&mapped);
    }

    let first = addr.segments()[0];
    addr.is_loopback()
        || addr.is_unspecified()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link-local
        || (first & 0xffc0) == 0xfe80
}

/// Convert a std duration for timestamp arithmetic, saturating at a century
pub fn to_chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    let millis = duration.subsec_millis();

    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else if seconds > 0 {
        format!("{}.{}s", seconds, millis / 100)
    } else {
        format!("{millis}ms")
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Whether `protocol` occurs in `lowered` at the start or right after a
/// delimiter, so `metadata:` or `?q=profile:1` do not count as `data:`/`file:`
fn contains_protocol(lowered: &str, protocol: &str) -> bool {
    lowered.match_indices(protocol).any(|(at, _)| {
        lowered[..at]
            .chars()
            .next_back()
            .map_or(true, |c| c.is_whitespace() || PROTOCOL_BOUNDARIES.contains(&c))
    })
}
