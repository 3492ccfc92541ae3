pub mod caption;

pub use caption::{CaptionBridge, CaptionEndpoint, CaptionError, WebhookCaptionEndpoint};
