//! Client authentication for the `/v1` surface.
//!
//! Callers present a relay key as `Authorization: Bearer` or `x-api-key`.
//! Keys are matched by SHA-256 digest; the digest comparison is
//! constant-time so response timing leaks nothing about stored hashes.

use axum::http::HeaderMap;

use crate::store::SharedStore;
use crate::tenants::{hash_key, ApiKey, User};

/// Compare two strings in constant time.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Why authentication failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    MissingCredentials,
    UnknownKey,
    DisabledUser,
}

/// Pull the presented key out of the request headers.
fn presented_key(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return Some(token.to_string());
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

/// Authenticate a request: resolve the presented key to its key and user
/// records. Disabled keys never match (the store filters them); disabled
/// users fail closed.
pub async fn authenticate(
    headers: &HeaderMap,
    store: &SharedStore,
) -> Result<(ApiKey, User), AuthFailure> {
    let Some(raw) = presented_key(headers) else {
        return Err(AuthFailure::MissingCredentials);
    };
    let digest = hash_key(&raw);
    let key = match store.find_key_by_hash(&digest).await {
        Ok(Some(key)) => key,
        Ok(None) => return Err(AuthFailure::UnknownKey),
        Err(e) => {
            tracing::error!(error = %e, "Key lookup failed");
            return Err(AuthFailure::UnknownKey);
        }
    };
    let user = match store.get_user(key.user_id).await {
        Ok(Some(user)) if user.enabled => user,
        Ok(Some(_)) => return Err(AuthFailure::DisabledUser),
        Ok(None) => return Err(AuthFailure::UnknownKey),
        Err(e) => {
            tracing::error!(error = %e, "User lookup failed");
            return Err(AuthFailure::UnknownKey);
        }
    };
    Ok((key, user))
}

/// Verify the admin bearer token.
pub fn verify_admin(headers: &HeaderMap, expected: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| constant_time_eq(token, expected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::tenants::{generate_key, test_user};
    use chrono::Utc;
    use std::sync::Arc;
    use uuid::Uuid;

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "abcd"));
        assert!(constant_time_eq("", ""));
    }

    async fn seeded_store() -> (SharedStore, String) {
        let store = Arc::new(Store::open_in_memory().expect("open"));
        let user = test_user();
        store.upsert_user(&user).await.expect("user");
        let (raw, prefix) = generate_key();
        let key = ApiKey {
            id: Uuid::new_v4(),
            user_id: user.id,
            name: "test".to_string(),
            key_hash: hash_key(&raw),
            key_prefix: prefix,
            enabled: true,
            limits: Default::default(),
            limit_concurrent_sessions: None,
            provider_groups: Default::default(),
            total_cost_reset_at: Utc::now(),
            created_at: Utc::now(),
        };
        store.upsert_key(&key).await.expect("key");
        (store, raw)
    }

    #[tokio::test]
    async fn bearer_and_x_api_key_both_accepted() {
        let (store, raw) = seeded_store().await;

        let mut headers = HeaderMap::new();
        headers.insert("authorization", format!("Bearer {}", raw).parse().unwrap());
        assert!(authenticate(&headers, &store).await.is_ok());

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", raw.parse().unwrap());
        assert!(authenticate(&headers, &store).await.is_ok());
    }

    #[tokio::test]
    async fn missing_and_unknown_keys_rejected() {
        let (store, _raw) = seeded_store().await;

        let headers = HeaderMap::new();
        assert_eq!(
            authenticate(&headers, &store).await.unwrap_err(),
            AuthFailure::MissingCredentials
        );

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "sk-relay-bogus".parse().unwrap());
        assert_eq!(
            authenticate(&headers, &store).await.unwrap_err(),
            AuthFailure::UnknownKey
        );
    }

    #[tokio::test]
    async fn disabled_user_fails_closed() {
        let store = Arc::new(Store::open_in_memory().expect("open"));
        let mut user = test_user();
        user.enabled = false;
        store.upsert_user(&user).await.expect("user");
        let (raw, prefix) = generate_key();
        let key = ApiKey {
            id: Uuid::new_v4(),
            user_id: user.id,
            name: "test".to_string(),
            key_hash: hash_key(&raw),
            key_prefix: prefix,
            enabled: true,
            limits: Default::default(),
            limit_concurrent_sessions: None,
            provider_groups: Default::default(),
            total_cost_reset_at: Utc::now(),
            created_at: Utc::now(),
        };
        store.upsert_key(&key).await.expect("key");

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", raw.parse().unwrap());
        assert_eq!(
            authenticate(&headers, &store).await.unwrap_err(),
            AuthFailure::DisabledUser
        );
    }

    #[test]
    fn admin_token_verification() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer secret".parse().unwrap());
        assert!(verify_admin(&headers, "secret"));
        assert!(!verify_admin(&headers, "other"));
        assert!(!verify_admin(&headers, ""));
    }
}
