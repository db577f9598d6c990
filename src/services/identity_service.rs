//! Authentication of bearer sessions and admin authorization.

use crate::services::metadata_service::{MetadataError, MetadataStore};
use axum::http::{HeaderMap, header};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("missing bearer token")]
    MissingCredentials,
    #[error("invalid or expired session")]
    InvalidSession,
    #[error("admin access required")]
    NotAdmin,
    #[error(transparent)]
    Store(#[from] MetadataError),
}

/// The authenticated identity behind a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: Uuid,
    pub email: String,
}

/// Which signal granted (or failed to grant) admin rights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminSource {
    Database,
    EmailMatch,
    EmailMatchFallback,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminStatus {
    pub is_admin: bool,
    pub source: AdminSource,
}

#[derive(Clone)]
pub struct IdentityService {
    metadata: MetadataStore,

    /// Email that is treated as admin even without the database flag.
    admin_email: Option<String>,
}

impl IdentityService {
    pub fn new(metadata: MetadataStore, admin_email: Option<String>) -> Self {
        Self {
            metadata,
            admin_email: admin_email.filter(|email| !email.trim().is_empty()),
        }
    }

    /// Resolve `Authorization: Bearer <token>` to a caller.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Caller, IdentityError> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(IdentityError::MissingCredentials)?;

        let user = self
            .metadata
            .find_session_user(token)
            .await?
            .ok_or(IdentityError::InvalidSession)?;

        Ok(Caller {
            user_id: user.id,
            email: user.email,
        })
    }

    /// Admin status of `caller`: the database flag first, then the
    /// configured admin email. A failed lookup falls back to the email.
    pub async fn admin_status(&self, caller: &Caller) -> AdminStatus {
        let email_match = self
            .admin_email
            .as_deref()
            .is_some_and(|admin| admin.eq_ignore_ascii_case(&caller.email));

        match self.metadata.find_user(caller.user_id).await {
            Ok(Some(user)) if user.is_admin => AdminStatus {
                is_admin: true,
                source: AdminSource::Database,
            },
            Ok(_) => AdminStatus {
                is_admin: email_match,
                source: if email_match {
                    AdminSource::EmailMatch
                } else {
                    AdminSource::None
                },
            },
            Err(err) => {
                warn!(
                    user_id = %caller.user_id,
                    error = %err,
                    "admin lookup failed; using email marker"
                );
                AdminStatus {
                    is_admin: email_match,
                    source: AdminSource::EmailMatchFallback,
                }
            }
        }
    }

    pub async fn require_admin(&self, caller: &Caller) -> Result<(), IdentityError> {
        if self.admin_status(caller).await.is_admin {
            Ok(())
        } else {
            Err(IdentityError::NotAdmin)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::metadata_service::tests::memory_store;
    use axum::http::HeaderValue;
    use chrono::Duration;

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn rejects_missing_and_unknown_tokens() {
        let identity = IdentityService::new(memory_store().await, None);
        assert!(matches!(
            identity.authenticate(&HeaderMap::new()).await,
            Err(IdentityError::MissingCredentials)
        ));
        assert!(matches!(
            identity.authenticate(&bearer("nope")).await,
            Err(IdentityError::InvalidSession)
        ));
    }

    #[tokio::test]
    async fn database_flag_grants_admin() {
        let store = memory_store().await;
        let user = store.upsert_user("admin@example.com", true).await.unwrap();
        let token = store.create_session(user.id, Duration::hours(1)).await.unwrap();
        let identity = IdentityService::new(store, None);

        let caller = identity.authenticate(&bearer(&token)).await.unwrap();
        assert_eq!(caller.user_id, user.id);
        assert_eq!(
            identity.admin_status(&caller).await,
            AdminStatus {
                is_admin: true,
                source: AdminSource::Database
            }
        );
    }

    #[tokio::test]
    async fn email_marker_grants_admin() {
        let store = memory_store().await;
        let user = store.upsert_user("Owner@Example.com", false).await.unwrap();
        let identity = IdentityService::new(store, Some("owner@example.com".into()));
        let caller = Caller {
            user_id: user.id,
            email: user.email,
        };

        let status = identity.admin_status(&caller).await;
        assert_eq!(status.source, AdminSource::EmailMatch);
        assert!(identity.require_admin(&caller).await.is_ok());
    }

    #[tokio::test]
    async fn plain_user_is_forbidden() {
        let store = memory_store().await;
        let user = store.upsert_user("user@example.com", false).await.unwrap();
        let identity = IdentityService::new(store, Some(String::new()));
        let caller = Caller {
            user_id: user.id,
            email: user.email,
        };

        assert_eq!(identity.admin_status(&caller).await.source, AdminSource::None);
        assert!(matches!(
            identity.require_admin(&caller).await,
            Err(IdentityError::NotAdmin)
        ));
    }
}
