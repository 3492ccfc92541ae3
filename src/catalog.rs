use crate::images::deserialize_images;
use crate::models::ListingType;
use crate::profile::{PROFILES_TABLE, Profile, first_profile};
use crate::session::SessionContext;
use crate::supabase::{Backend, Query, SupabaseError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{DefaultOnNull, serde_as};
use std::sync::Arc;
use tracing::{info, warn};

/// A listing row as read back from either listings table. Nullable columns
/// and legacy image encodings are tolerated.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    #[serde(default)]
    pub id: Value,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub name: String,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub price: f64,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub seller: String,
    #[serde(default)]
    pub seller_id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_images")]
    pub images: Vec<String>,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub description: String,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, rename = "timeRemaining", skip_serializing_if = "Option::is_none")]
    pub time_remaining: Option<u64>,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Rows that cannot be read as listings are logged and dropped.
pub fn parse_rows(table: &str, rows: Vec<Value>) -> Vec<Listing> {
    rows.into_iter()
        .filter_map(|row| match serde_json::from_value::<Listing>(row) {
            Ok(listing) => Some(listing),
            Err(err) => {
                warn!(target = "wayover.supabase", table, error = %err, "listing_row_skipped");
                None
            }
        })
        .collect()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BrowseFilter {
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
}

const SELLERS_TABLE: &str = "sellers";

#[derive(Debug, Clone, Default, Serialize)]
pub struct SellerListings {
    pub seller: Profile,
    /// The caller is looking at their own page.
    pub is_owner: bool,
    pub live: Vec<Listing>,
    pub standard: Vec<Listing>,
}

#[derive(Clone)]
pub struct Catalog {
    backend: Arc<dyn Backend>,
}

impl Catalog {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Standard listings, newest first, narrowed by tag and name search.
    pub async fn browse(&self, filter: &BrowseFilter) -> Result<Vec<Listing>, SupabaseError> {
        let table = ListingType::Standard.table();
        let mut query = Query::table(table).newest_first("created_at");
        if let Some(tag) = filter
            .tag
            .as_deref()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
        {
            query = query.contains("tags", vec![tag]);
        }
        if let Some(term) = filter.search.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            query = query.ilike("name", format!("%{term}%"));
        }
        let rows = self.backend.query(&query).await?;
        Ok(parse_rows(table, rows))
    }

    /// The seller's profile and both kinds of listings. `None` when neither
    /// `profiles` nor the legacy `sellers` table knows the username.
    pub async fn seller_listings(
        &self,
        username: &str,
        viewer: &SessionContext,
    ) -> Result<Option<SellerListings>, SupabaseError> {
        let username = username.trim();
        let Some((seller, is_owner)) = self.find_seller(username, viewer).await? else {
            return Ok(None);
        };
        let mut found = SellerListings {
            seller,
            is_owner,
            ..SellerListings::default()
        };
        for listing_type in [ListingType::TimeBoxed, ListingType::Standard] {
            let table = listing_type.table();
            let rows = self
                .backend
                .query(&Query::table(table).ilike("seller", username))
                .await?;
            let listings = parse_rows(table, rows);
            match listing_type {
                ListingType::TimeBoxed => found.live = listings,
                ListingType::Standard => found.standard = listings,
            }
        }
        Ok(Some(found))
    }

    async fn find_seller(
        &self,
        username: &str,
        viewer: &SessionContext,
    ) -> Result<Option<(Profile, bool)>, SupabaseError> {
        if username.is_empty() {
            return Ok(None);
        }
        let by_name = |table: &str| Query::table(table).ilike("username", username).limit(1);
        if let Some(profile) = first_profile(self.backend.query(&by_name(PROFILES_TABLE)).await?) {
            let is_owner = profile.belongs_to(viewer);
            return Ok(Some((profile, is_owner)));
        }
        let legacy = first_profile(self.backend.query(&by_name(SELLERS_TABLE)).await?);
        Ok(legacy.map(|seller| (seller, false)))
    }

    /// Deletes one of the caller's own listings. Returns `false` when no row
    /// with that id belongs to the caller.
    pub async fn delete_own(
        &self,
        session: &SessionContext,
        listing_type: ListingType,
        id: &str,
    ) -> Result<bool, SupabaseError> {
        let query = Query::table(listing_type.table())
            .eq("id", id)
            .eq("seller_id", &session.user_id);
        let removed = self.backend.delete(&query).await?;
        info!(
            target = "wayover.supabase",
            table = listing_type.table(),
            id,
            user_id = %session.user_id,
            removed,
            "listing_delete"
        );
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{InMemoryBackend, session_for};
    use serde_json::json;

    fn seeded() -> Arc<InMemoryBackend> {
        let backend = Arc::new(InMemoryBackend::default());
        backend.seed(
            "listings",
            json!({"id": 1, "name": "Denim Jacket", "price": 35, "seller": "ThriftQueen", "seller_id": "u1",
                   "images": "[\"https://s/1.webp\"]", "tags": ["denim"], "created_at": "2025-01-01T00:00:00Z"}),
        );
        backend.seed(
            "listings",
            json!({"id": 2, "name": "Band Tee", "price": 20, "seller": "other", "seller_id": "u2",
                   "images": ["https://s/2.webp"], "tags": null, "description": null, "created_at": "2025-02-01T00:00:00Z"}),
        );
        backend.seed(
            "livelistings",
            json!({"id": 7, "name": "Silk Scarf", "price": 12, "seller": "thriftqueen", "seller_id": "u1",
                   "images": "https://s/7.webp", "timeRemaining": 300}),
        );
        backend
    }

    #[tokio::test]
    async fn browse_is_newest_first_and_filters() {
        let catalog = Catalog::new(seeded());

        let all = catalog.browse(&BrowseFilter::default()).await.unwrap();
        assert_eq!(all.iter().map(|l| l.name.as_str()).collect::<Vec<_>>(), ["Band Tee", "Denim Jacket"]);
        assert_eq!(all[0].description, "");
        assert!(all[0].tags.is_empty());
        assert_eq!(all[1].images, vec!["https://s/1.webp"]);

        let tagged = catalog
            .browse(&BrowseFilter {
                tag: Some("Denim".into()),
                search: None,
            })
            .await
            .unwrap();
        assert_eq!(tagged.len(), 1);

        let searched = catalog
            .browse(&BrowseFilter {
                search: Some(" tee ".into()),
                tag: None,
            })
            .await
            .unwrap();
        assert_eq!(searched[0].name, "Band Tee");
    }

    #[tokio::test]
    async fn seller_listings_span_both_tables() {
        let backend = seeded();
        backend.seed("profiles", json!({"id": "u1", "username": "ThriftQueen", "location": "Bandung"}));
        let catalog = Catalog::new(backend);

        let found = catalog
            .seller_listings("THRIFTQUEEN", &session_for("u1", None))
            .await
            .unwrap()
            .unwrap();
        assert!(found.is_owner);
        assert_eq!(found.seller.location.as_deref(), Some("Bandung"));
        assert_eq!(found.live.len(), 1);
        assert_eq!(found.live[0].time_remaining, Some(300));
        assert_eq!(found.live[0].images, vec!["https://s/7.webp"]);
        assert_eq!(found.standard.len(), 1);
    }

    #[tokio::test]
    async fn legacy_sellers_and_unknown_names() {
        let backend = seeded();
        backend.seed("sellers", json!({"id": 3, "username": "other", "avatar_url": null}));
        let catalog = Catalog::new(backend);
        let viewer = session_for("u1", None);

        let legacy = catalog.seller_listings("Other", &viewer).await.unwrap().unwrap();
        assert!(!legacy.is_owner);
        assert_eq!(legacy.seller.username, "other");
        assert_eq!(legacy.standard.len(), 1);

        assert!(catalog.seller_listings("nobody", &viewer).await.unwrap().is_none());
        assert!(catalog.seller_listings("  ", &viewer).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn only_the_owner_can_delete() {
        let backend = seeded();
        let catalog = Catalog::new(backend.clone());
        let stranger = session_for("u2", None);
        assert!(!catalog.delete_own(&stranger, ListingType::Standard, "1").await.unwrap());
        assert_eq!(backend.rows("listings").len(), 2);

        let owner = session_for("u1", None);
        assert!(catalog.delete_own(&owner, ListingType::Standard, "1").await.unwrap());
        assert_eq!(backend.rows("listings").len(), 1);
        assert!(catalog.delete_own(&owner, ListingType::TimeBoxed, "7").await.unwrap());
        assert!(backend.rows("livelistings").is_empty());
    }

    #[test]
    fn unreadable_rows_are_dropped() {
        let rows = vec![json!({"name": "ok"}), json!({"name": "bad", "price": "free"})];
        let parsed = parse_rows("listings", rows);
        assert_eq!(parsed.len(), 1);
    }
}
