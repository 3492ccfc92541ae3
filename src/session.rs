use crate::supabase::{Backend, SupabaseError};
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Authenticated caller, passed explicitly to everything that acts on its behalf.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionContext {
    pub user_id: String,
    pub email: Option<String>,
    pub access_token: String,
}

impl SessionContext {
    /// Local part of the account email, used when no profile name is stored.
    pub fn email_handle(&self) -> Option<String> {
        self.email
            .as_deref()
            .and_then(|email| email.split('@').next())
            .map(str::trim)
            .filter(|handle| !handle.is_empty())
            .map(str::to_string)
    }
}

struct CachedSession {
    session: SessionContext,
    checked_at: Instant,
}

/// Sessions resolved from access tokens. An entry is trusted for `ttl` after
/// the backend last confirmed its token, then checked again; entries are
/// dropped on sign-out, on rejection, or once stale.
#[derive(Clone)]
pub struct SessionCache {
    sessions: Arc<RwLock<HashMap<String, CachedSession>>>,
    ttl: Duration,
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl SessionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    pub fn from_env() -> Self {
        let ttl = std::env::var("SESSION_TTL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(300);
        Self::new(Duration::from_secs(ttl))
    }

    pub async fn acquire(
        &self,
        backend: &dyn Backend,
        access_token: &str,
    ) -> Result<SessionContext, SupabaseError> {
        if let Some(found) = self.sessions.read().await.get(access_token)
            && found.checked_at.elapsed() < self.ttl
        {
            return Ok(found.session.clone());
        }

        let user = match backend.user_for_token(access_token).await {
            Ok(user) => user,
            Err(err) => {
                if matches!(err, SupabaseError::Unauthorized) {
                    self.sessions.write().await.remove(access_token);
                }
                return Err(err);
            }
        };
        let session = SessionContext {
            user_id: user.id,
            email: user.email,
            access_token: access_token.to_string(),
        };
        debug!(target = "wayover.session", user_id = %session.user_id, "session_acquired");

        let mut sessions = self.sessions.write().await;
        let ttl = self.ttl;
        sessions.retain(|_, cached| cached.checked_at.elapsed() < ttl);
        sessions.insert(
            access_token.to_string(),
            CachedSession {
                session: session.clone(),
                checked_at: Instant::now(),
            },
        );
        Ok(session)
    }

    pub async fn invalidate(&self, backend: &dyn Backend, session: &SessionContext) {
        self.sessions.write().await.remove(&session.access_token);
        if let Err(err) = backend.sign_out(&session.access_token).await {
            debug!(target = "wayover.session", error = %err, "remote_sign_out_failed");
        }
        info!(target = "wayover.session", user_id = %session.user_id, "session_invalidated");
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}
