use axum::http::{HeaderMap, header};
use jsonwebtoken::{DecodingKey, Validation, decode};
use tracing::debug;

use parley_gateway::Identity;
use parley_types::api::Claims;
use parley_types::models::UserRef;

/// Resolve the `?token=` query parameter. A missing, expired or forged
/// token yields an anonymous identity; authorization rejects it later.
pub fn identify(secret: &str, token: Option<&str>) -> Identity {
    let Some(token) = token.filter(|t| !t.is_empty()) else {
        return Identity::Anonymous;
    };

    match decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    ) {
        Ok(data) => Identity::User(UserRef {
            id: data.claims.sub,
            username: data.claims.username,
        }),
        Err(e) => {
            debug!("Rejecting bearer token: {}", e);
            Identity::Anonymous
        }
    }
}

/// Check `Authorization: Bearer <key>` against the internal service key.
pub fn has_internal_key(headers: &HeaderMap, expected: &str) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|presented| presented == expected)
}
