use once_cell::sync::Lazy;
use std::env;

pub static LISTING_IMAGES_BUCKET: Lazy<String> =
    Lazy::new(|| env::var("LISTING_IMAGES_BUCKET").unwrap_or_else(|_| "listing-images".into()));

pub static AVATARS_BUCKET: Lazy<String> =
    Lazy::new(|| env::var("AVATARS_BUCKET").unwrap_or_else(|_| "avatars".into()));

pub static SCRAPER_WEBHOOK_URL: Lazy<String> = Lazy::new(|| {
    env::var("SCRAPER_WEBHOOK_URL")
        .unwrap_or_else(|_| "http://localhost:5678/webhook/fetch-insta".into())
});

pub static CAPTION_WEBHOOK_URL: Lazy<String> = Lazy::new(|| {
    env::var("CAPTION_WEBHOOK_URL")
        .unwrap_or_else(|_| "http://localhost:5678/webhook/parse-caption".into())
});

pub static RATE_SERVICE_URL: Lazy<String> = Lazy::new(|| {
    env::var("RATE_SERVICE_URL")
        .map(|url| url.trim_end_matches('/').to_string())
        .unwrap_or_else(|_| "https://api.frankfurter.app".into())
});

pub static IMAGE_PROXY_URL: Lazy<String> =
    Lazy::new(|| env::var("IMAGE_PROXY_URL").unwrap_or_else(|_| "https://wsrv.nl/".into()));

/// Remaining duration written to new time-boxed listings.
pub static LIVE_LISTING_DURATION_SECS: Lazy<u64> =
    Lazy::new(|| positive_from_env("LIVE_LISTING_DURATION_SECS", 900));

pub static IMPORT_PAGE_SIZE: Lazy<usize> =
    Lazy::new(|| positive_from_env("IMPORT_PAGE_SIZE", 4) as usize);

pub static IMPORT_BATCH_SIZE: Lazy<usize> =
    Lazy::new(|| positive_from_env("IMPORT_BATCH_SIZE", 12) as usize);

pub static MAX_IMAGES: Lazy<usize> = Lazy::new(|| positive_from_env("MAX_IMAGES", 10) as usize);

/// Upload jobs allowed to run at once; later submissions wait as `queued`.
pub static UPLOAD_CONCURRENCY: Lazy<usize> =
    Lazy::new(|| positive_from_env("UPLOAD_CONCURRENCY", 4) as usize);

pub const MAX_TAGS: usize = 5;

fn positive_from_env(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}
