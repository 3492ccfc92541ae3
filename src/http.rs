use reqwest::Client;
use std::time::Duration;

/// Upper bound for a single outbound call, shared by every collaborator.
pub fn request_timeout() -> Duration {
    Duration::from_secs(secs_from_env("HTTP_TIMEOUT_SECS", 15))
}

pub fn build_client() -> Client {
    let connect = secs_from_env("HTTP_CONNECT_TIMEOUT_SECS", 5);
    Client::builder()
        .timeout(request_timeout())
        .connect_timeout(Duration::from_secs(connect))
        .user_agent(concat!("wayover-api-rs/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| Client::new())
}

fn secs_from_env(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}
