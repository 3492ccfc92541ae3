//! Seller profiles: the public name listings are published under, plus
//! location and avatar.

use crate::models::ImageInput;
use crate::session::SessionContext;
use crate::storage::{content_type_for, decode_local, extension_of};
use crate::supabase::{Backend, Query, SupabaseError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use serde_with::{DefaultOnNull, serde_as};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

pub const PROFILES_TABLE: &str = "profiles";

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("username is required")]
    UsernameRequired,
    #[error("profile not found")]
    NotFound,
    #[error(transparent)]
    Backend(#[from] SupabaseError),
}

/// A row from `profiles` or the legacy `sellers` table.
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub id: Value,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl Profile {
    pub fn belongs_to(&self, session: &SessionContext) -> bool {
        self.id.as_str() == Some(session.user_id.as_str())
    }
}

/// Onboarding form. Absent fields keep their stored value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileUpdate {
    pub username: String,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    /// A picked file is uploaded; a URL is stored as-is.
    #[serde(default)]
    pub avatar: Option<ImageInput>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SavedProfile {
    pub profile: Profile,
    /// Set when the new avatar could not be stored; the rest was saved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_error: Option<String>,
}

#[derive(Clone)]
pub struct ProfileStore {
    backend: Arc<dyn Backend>,
    bucket: String,
}

impl ProfileStore {
    pub fn new(backend: Arc<dyn Backend>, bucket: &str) -> Self {
        Self {
            backend,
            bucket: bucket.to_string(),
        }
    }

    pub async fn own(&self, session: &SessionContext) -> Result<Profile, ProfileError> {
        let query = Query::table(PROFILES_TABLE)
            .eq("id", &session.user_id)
            .limit(1);
        first_profile(self.backend.query(&query).await?).ok_or(ProfileError::NotFound)
    }

    pub async fn save(
        &self,
        session: &SessionContext,
        update: ProfileUpdate,
    ) -> Result<SavedProfile, ProfileError> {
        let username = update.username.trim();
        if username.is_empty() {
            return Err(ProfileError::UsernameRequired);
        }

        let mut changes = Map::new();
        changes.insert("username".into(), json!(username));
        if let Some(country) = update.country {
            changes.insert("country".into(), json!(country.trim()));
        }
        if let Some(location) = update.location {
            changes.insert("location".into(), json!(location.trim()));
        }

        let mut avatar_error = None;
        match update.avatar {
            Some(ImageInput::Local { file_name, data }) => {
                match self.upload_avatar(&session.user_id, &file_name, &data).await {
                    Ok(url) => {
                        changes.insert("avatar_url".into(), json!(url));
                    }
                    Err(reason) => {
                        warn!(target = "wayover.storage", user_id = %session.user_id, reason = %reason, "avatar_skipped");
                        avatar_error = Some(reason);
                    }
                }
            }
            Some(ImageInput::Remote(url)) if !url.trim().is_empty() => {
                changes.insert("avatar_url".into(), json!(url.trim()));
            }
            Some(ImageInput::Remote(_)) | None => {}
        }

        let query = Query::table(PROFILES_TABLE).eq("id", &session.user_id);
        let updated = self
            .backend
            .update(&query, Value::Object(changes.clone()))
            .await?;
        if updated == 0 {
            changes.insert("id".into(), json!(session.user_id));
            self.backend
                .insert(PROFILES_TABLE, Value::Object(changes))
                .await?;
        }
        info!(target = "wayover.supabase", user_id = %session.user_id, created = updated == 0, "profile_saved");

        Ok(SavedProfile {
            profile: self.own(session).await?,
            avatar_error,
        })
    }

    /// `<uid>-<millis>.<ext>` in the avatars bucket.
    async fn upload_avatar(&self, owner: &str, file_name: &str, data: &str) -> Result<String, String> {
        let bytes = decode_local(data)
            .filter(|bytes| !bytes.is_empty())
            .ok_or_else(|| "invalid base64 payload".to_string())?;
        let ext = extension_of(file_name);
        let path = format!("{owner}-{}.{ext}", chrono::Utc::now().timestamp_millis());
        self.backend
            .store_object(&self.bucket, &path, bytes, content_type_for(&ext))
            .await
            .map_err(|err| err.to_string())
    }
}

pub fn first_profile(rows: Vec<Value>) -> Option<Profile> {
    rows.into_iter()
        .find_map(|row| serde_json::from_value::<Profile>(row).ok())
}
