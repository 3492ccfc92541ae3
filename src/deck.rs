use crate::catalog::{Listing, parse_rows};
use crate::images::{ImageSize, ProxyOptions, placeholder_url, proxy_url};
use crate::models::ListingType;
use crate::supabase::{Backend, Query, SupabaseError};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

pub const DEFAULT_TIME_REMAINING_SECS: u64 = 900;
const DECK_SIZE: usize = 20;
const VISIBLE_CARDS: usize = 3;

#[derive(Debug, Clone, Serialize)]
pub struct DeckCard {
    #[serde(flatten)]
    pub listing: Listing,
    pub expires_at: DateTime<Utc>,
    /// Card-sized rendition of the first image, with its blurred stand-in.
    pub preview: Option<String>,
    pub placeholder: Option<String>,
}

/// Time-boxed listings shown as an endless stack of cards.
#[derive(Debug, Clone, Default)]
pub struct SwipeDeck {
    cards: Vec<DeckCard>,
}

impl SwipeDeck {
    pub async fn load(backend: &dyn Backend) -> Result<Self, SupabaseError> {
        let table = ListingType::TimeBoxed.table();
        let query = Query::table(table).newest_first("created_at").limit(DECK_SIZE);
        let rows = backend.query(&query).await?;
        Ok(Self::from_listings(parse_rows(table, rows), Utc::now()))
    }

    /// Each card expires `timeRemaining` seconds after `loaded_at`.
    pub fn from_listings(listings: Vec<Listing>, loaded_at: DateTime<Utc>) -> Self {
        let cards = listings
            .into_iter()
            .map(|mut listing| {
                let remaining = listing
                    .time_remaining
                    .filter(|secs| *secs > 0)
                    .unwrap_or(DEFAULT_TIME_REMAINING_SECS);
                listing.time_remaining = Some(remaining);
                let expires_at = i64::try_from(remaining)
                    .ok()
                    .and_then(Duration::try_seconds)
                    .and_then(|ttl| loaded_at.checked_add_signed(ttl))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                let cover = listing.images.first();
                DeckCard {
                    preview: cover.map(|url| proxy_url(url, &ProxyOptions::sized(ImageSize::Card))),
                    placeholder: cover.map(|url| placeholder_url(url)),
                    listing,
                    expires_at,
                }
            })
            .collect();
        Self { cards }
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    /// Up to three cards starting at `index`, wrapping around the deck.
    pub fn visible(&self, index: u64) -> Vec<&DeckCard> {
        let len = self.cards.len();
        if len == 0 {
            return Vec::new();
        }
        let start = (index % len as u64) as usize;
        (0..VISIBLE_CARDS.min(len))
            .map(|offset| &self.cards[(start + offset) % len])
            .collect()
    }

    pub fn top_seller(&self, index: u64) -> Option<&str> {
        self.visible(index)
            .first()
            .map(|card| card.listing.seller.as_str())
    }
}

pub fn next_index(index: u64) -> u64 {
    index.checked_add(1).unwrap_or(0)
}
