use crate::models::{ListingDraft, ListingRecord, ListingType, PriceField};
use crate::pipeline::PipelineError;
use crate::session::SessionContext;
use crate::supabase::{Backend, Query};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

const STAGE: &str = "write_listing";

#[derive(Debug, Clone, Serialize)]
pub struct WrittenListing {
    pub table: &'static str,
    pub record: ListingRecord,
}

/// Checks shared by pre-flight validation and the final insert.
/// Returns the parsed price.
pub fn validate_listing(
    name: &str,
    price: &PriceField,
    image_count: usize,
    stage: &'static str,
) -> Result<f64, PipelineError> {
    if name.trim().is_empty() {
        return Err(PipelineError::invalid_input(stage, "title is required"));
    }
    if price.is_blank() {
        return Err(PipelineError::invalid_input(stage, "price is required"));
    }
    let price = price
        .parse()
        .ok_or_else(|| PipelineError::invalid_input(stage, "price must be a non-negative number"))?;
    if image_count == 0 {
        return Err(PipelineError::invalid_input(stage, "at least one image is required"));
    }
    Ok(price)
}

pub struct ListingWriter {
    backend: Arc<dyn Backend>,
    live_duration_secs: u64,
}

impl ListingWriter {
    pub fn new(backend: Arc<dyn Backend>, live_duration_secs: u64) -> Self {
        Self {
            backend,
            live_duration_secs,
        }
    }

    /// Stored profile name, else the email handle, else "Unknown".
    pub async fn seller_name(&self, session: &SessionContext) -> String {
        let query = Query::table("profiles").eq("id", &session.user_id).limit(1);
        let stored = match self.backend.query(&query).await {
            Ok(rows) => rows
                .first()
                .and_then(|row| row.get("username"))
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string),
            Err(err) => {
                warn!(target = "wayover.supabase", user_id = %session.user_id, error = %err, "profile_lookup_failed");
                None
            }
        };
        stored
            .or_else(|| session.email_handle())
            .unwrap_or_else(|| "Unknown".to_string())
    }

    pub fn build_record(
        &self,
        draft: &ListingDraft,
        price: f64,
        seller: String,
        seller_id: &str,
        images: Vec<String>,
    ) -> ListingRecord {
        ListingRecord {
            name: draft.name.trim().to_string(),
            price,
            seller,
            seller_id: seller_id.to_string(),
            images,
            description: draft.description.clone(),
            tags: draft.tags.as_slice().to_vec(),
            created_at: Utc::now(),
            time_remaining: match draft.listing_type {
                ListingType::TimeBoxed => Some(self.live_duration_secs),
                ListingType::Standard => None,
            },
        }
    }

    /// Inserts exactly one row into the table for the draft's listing type.
    pub async fn write(
        &self,
        session: &SessionContext,
        draft: &ListingDraft,
        images: Vec<String>,
    ) -> Result<WrittenListing, PipelineError> {
        let price = validate_listing(&draft.name, &draft.price, images.len(), STAGE)?;
        let seller = self.seller_name(session).await;
        let record = self.build_record(draft, price, seller, &session.user_id, images);
        let table = draft.listing_type.table();
        let row = serde_json::to_value(&record)
            .map_err(|err| PipelineError::internal(STAGE, err.to_string()))?;
        self.backend
            .insert(table, row)
            .await
            .map_err(|err| PipelineError::internal(STAGE, err.to_string()))?;
        info!(
            target = "wayover.supabase",
            table,
            seller_id = %record.seller_id,
            images = record.images.len(),
            "listing_inserted"
        );
        Ok(WrittenListing { table, record })
    }
}
