use std::time::Duration;

use anyhow::Context;
use tracing::{debug, warn};

pub const IP_SERVICES: [&str; 4] = [
    "https://api.ipify.org",
    "https://ifconfig.me/ip",
    "https://icanhazip.com",
    "https://wtfismyip.com/text",
];

pub const UNKNOWN_IP: &str = "unknown";

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

pub fn build_http_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(timeout)
        .user_agent(concat!("tsync/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("building reqwest client")
}

/// First non-empty 2xx body from the lookup services, or [`UNKNOWN_IP`].
pub async fn detect_public_ip(client: &reqwest::Client, services: &[&str]) -> String {
    for url in services {
        match client.get(*url).timeout(LOOKUP_TIMEOUT).send().await {
            Ok(resp) if resp.status().is_success() => match resp.text().await {
                Ok(body) => {
                    let ip = body.trim();
                    if !ip.is_empty() && ip.len() <= 45 {
                        debug!(service = url, ip, "public ip detected");
                        return ip.to_string();
                    }
                }
                Err(err) => debug!(service = url, error = %err, "ip lookup body unreadable"),
            },
            Ok(resp) => debug!(service = url, status = resp.status().as_u16(), "ip lookup rejected"),
            Err(err) => debug!(service = url, error = %err, "ip lookup failed"),
        }
    }
    warn!("could not determine public ip; using {UNKNOWN_IP:?}");
    UNKNOWN_IP.to_string()
}
