//! Webhook dispatch on new-error creation, with an SSRF guard against the
//! configured URL (spec.md §4.6, §6): scheme allowlist, literal
//! private/reserved IP rejection, and a DNS-rebinding check that re-resolves
//! the hostname immediately before sending.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use errly_protocol::ErrorGroup;
use tracing::warn;

const DISPATCH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WebhookGuardError {
    #[error("webhook url must use http or https")]
    UnsupportedScheme,
    #[error("webhook url has no host")]
    MissingHost,
    #[error("webhook url resolves to a private or reserved address")]
    PrivateAddress,
}

fn is_private_or_reserved(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_or_reserved_v4(v4),
        IpAddr::V6(v6) => is_private_or_reserved_v6(v6),
    }
}

fn is_private_or_reserved_v4(ip: Ipv4Addr) -> bool {
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.octets()[0] == 0
}

fn is_private_or_reserved_v6(ip: Ipv6Addr) -> bool {
    if ip.is_loopback() {
        return true;
    }
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_private_or_reserved_v4(v4);
    }
    let segments = ip.segments();
    // fc00::/7
    if (segments[0] & 0xfe00) == 0xfc00 {
        return true;
    }
    // fe80::/10
    if (segments[0] & 0xffc0) == 0xfe80 {
        return true;
    }
    false
}

/// Static validation of the configured URL's scheme and any literal IP
/// host. Hostnames are validated again at dispatch time via DNS.
pub fn validate_url(url: &str) -> Result<url::Url, WebhookGuardError> {
    let parsed = url::Url::parse(url).map_err(|_| WebhookGuardError::MissingHost)?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(WebhookGuardError::UnsupportedScheme);
    }
    let host = parsed.host_str().ok_or(WebhookGuardError::MissingHost)?;
    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_private_or_reserved(ip) {
            return Err(WebhookGuardError::PrivateAddress);
        }
    }
    Ok(parsed)
}

/// Re-resolves the hostname and rejects if any returned address is private
/// or reserved, mitigating DNS rebinding between validation and dispatch.
pub async fn resolve_and_check(url: &url::Url) -> Result<(), WebhookGuardError> {
    let host = url.host_str().ok_or(WebhookGuardError::MissingHost)?;
    if host.parse::<IpAddr>().is_ok() {
        // Already checked as a literal in validate_url; nothing more to resolve.
        return Ok(());
    }
    let port = url.port_or_known_default().unwrap_or(443);
    let lookup_target = format!("{host}:{port}");
    let addrs = tokio::net::lookup_host(&lookup_target)
        .await
        .map_err(|_| WebhookGuardError::MissingHost)?;
    let mut any = false;
    for addr in addrs {
        any = true;
        if is_private_or_reserved(addr.ip()) {
            return Err(WebhookGuardError::PrivateAddress);
        }
    }
    if !any {
        return Err(WebhookGuardError::MissingHost);
    }
    Ok(())
}

#[derive(serde::Serialize)]
struct WebhookPayload<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    error: &'a ErrorGroup,
    timestamp: i64,
}

/// Dispatches the webhook for a newly created error group. Fire-and-forget:
/// failures are logged at warn and swallowed (spec.md §4.6).
pub async fn dispatch_new_error(http: &reqwest::Client, webhook_url: &str, group: &ErrorGroup, now_ms: i64) {
    let parsed = match validate_url(webhook_url) {
        Ok(url) => url,
        Err(e) => {
            warn!(error = %e, "webhook url failed SSRF guard, skipping dispatch");
            return;
        }
    };
    if let Err(e) = resolve_and_check(&parsed).await {
        warn!(error = %e, "webhook url re-resolution failed SSRF guard, skipping dispatch");
        return;
    }

    let payload = WebhookPayload { kind: "new-error", error: group, timestamp: now_ms };
    let result = http
        .post(parsed)
        .timeout(DISPATCH_TIMEOUT)
        .json(&payload)
        .send()
        .await;
    match result {
        Ok(response) if !response.status().is_success() => {
            warn!(status = %response.status(), "webhook dispatch returned non-success status");
        }
        Err(e) => {
            warn!(error = %e, "webhook dispatch failed");
        }
        Ok(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_http_scheme() {
        assert_eq!(validate_url("ftp://example.com"), Err(WebhookGuardError::UnsupportedScheme));
    }

    #[test]
    fn rejects_literal_loopback_and_private_v4() {
        assert_eq!(validate_url("http://127.0.0.1/hook"), Err(WebhookGuardError::PrivateAddress));
        assert_eq!(validate_url("http://10.0.0.5/hook"), Err(WebhookGuardError::PrivateAddress));
        assert_eq!(validate_url("http://192.168.1.1/hook"), Err(WebhookGuardError::PrivateAddress));
        assert_eq!(validate_url("http://169.254.1.1/hook"), Err(WebhookGuardError::PrivateAddress));
    }

    #[test]
    fn rejects_literal_ipv6_loopback_and_unique_local() {
        assert_eq!(validate_url("http://[::1]/hook"), Err(WebhookGuardError::PrivateAddress));
        assert_eq!(validate_url("http://[fc00::1]/hook"), Err(WebhookGuardError::PrivateAddress));
        assert_eq!(validate_url("http://[fe80::1]/hook"), Err(WebhookGuardError::PrivateAddress));
    }

    #[test]
    fn accepts_public_hostname() {
        assert!(validate_url("https://hooks.example.com/webhook").is_ok());
    }
}
