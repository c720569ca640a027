//! Invocation token check
//!
//! The gateway seals `{id, exp}` with the shared function secret and sends
//! it as `Authorization: bearer v01.<ciphertext>`.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderValue, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use gram_functions_core::{INVOKE_ID_HEADER, InvocationClaims};
use thiserror::Error;
use tracing::warn;

use crate::encryption::{Encryption, EncryptionError};
use crate::gateway::auth::bearer_token;

const TOKEN_VERSION: &str = "v01.";

/// Identity of an authenticated invocation, attached as a request extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    /// Invocation id from the token
    pub invocation_id: String,
    /// Calling principal; empty for gateway-issued tokens
    pub subject: String,
}

/// Why a token was refused. Only logged, never returned.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No usable `Authorization` header
    #[error("missing bearer token")]
    Missing,
    /// Token lacks the `v01.` prefix
    #[error("unsupported token version")]
    Version,
    /// Decrypt failure
    #[error("decrypt token: {0}")]
    Decrypt(#[from] EncryptionError),
    /// Plaintext is not the expected JSON
    #[error("decode token claims: {0}")]
    Claims(#[from] serde_json::Error),
    /// Claims have no id
    #[error("token has no invocation id")]
    MissingId,
    /// `exp` is in the past
    #[error("token expired")]
    Expired,
}

/// Validate an `Authorization` header value against `key`.
///
/// # Errors
///
/// Returns the first check that failed.
pub fn authorize(key: &Encryption, authorization: Option<&str>) -> Result<AuthContext, AuthError> {
    let token = authorization.and_then(bearer_token).ok_or(AuthError::Missing)?;
    let sealed = token.strip_prefix(TOKEN_VERSION).ok_or(AuthError::Version)?;
    let plaintext = key.decrypt(sealed)?;
    let claims: InvocationClaims = serde_json::from_slice(&plaintext)?;

    if claims.id.is_empty() {
        return Err(AuthError::MissingId);
    }
    if claims.exp <= Utc::now().timestamp() {
        return Err(AuthError::Expired);
    }

    Ok(AuthContext {
        invocation_id: claims.id,
        subject: String::new(),
    })
}

/// Rejects unauthenticated calls; echoes the invocation id on success.
pub async fn auth_middleware(
    State(key): State<Arc<Encryption>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let ctx = match authorize(&key, authorization) {
        Ok(ctx) => ctx,
        Err(e) => {
            warn!(error = %e, "rejected function invocation");
            return unauthorized();
        }
    };

    let echo = HeaderValue::from_str(&ctx.invocation_id).ok();
    request.extensions_mut().insert(ctx);
    let mut response = next.run(request).await;
    if let Some(id) = echo {
        response.headers_mut().insert(INVOKE_ID_HEADER, id);
    }
    response
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
        ],
        "Unauthorized\n",
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Extension, Router, middleware, routing::post};
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const TEST_KEY: &str = "dGVzdC1rZXktMTIzNDU2Nzg5MDEyMzQ1Njc4OTAxMjM=";

    fn key() -> Arc<Encryption> {
        let raw = STANDARD.decode(TEST_KEY).unwrap();
        Arc::new(Encryption::new(&raw).unwrap())
    }

    fn token(key: &Encryption, id: &str, exp: i64) -> String {
        let claims = InvocationClaims { id: id.into(), exp };
        format!("v01.{}", key.encrypt(&serde_json::to_vec(&claims).unwrap()).unwrap())
    }

    fn app(key: Arc<Encryption>) -> Router {
        Router::new()
            .route(
                "/tool-call",
                post(|Extension(ctx): Extension<AuthContext>| async move {
                    assert_eq!(ctx.subject, "");
                    ctx.invocation_id
                }),
            )
            .route_layer(middleware::from_fn_with_state(key, auth_middleware))
    }

    async fn call(app: Router, authorization: Option<String>) -> Response {
        let mut req = Request::post("/tool-call");
        if let Some(value) = authorization {
            req = req.header(header::AUTHORIZATION, value);
        }
        app.oneshot(req.body(Body::empty()).unwrap()).await.unwrap()
    }

    // ====================================================================
    // Middleware
    // ====================================================================

    #[tokio::test]
    async fn valid_token_reaches_handler() {
        let key = key();
        let tok = token(&key, "test-id-123", Utc::now().timestamp() + 3600);
        let resp = call(app(key), Some(format!("bearer {tok}"))).await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[INVOKE_ID_HEADER], "test-id-123");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"test-id-123");
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let key = key();
        let tok = token(&key, "test-id-123", Utc::now().timestamp() - 1);
        let resp = call(app(key), Some(format!("bearer {tok}"))).await;

        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/plain; charset=utf-8");
        assert_eq!(resp.headers()[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
        assert!(resp.headers().get(INVOKE_ID_HEADER).is_none());
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).trim_end().ends_with("Unauthorized"));
    }

    #[tokio::test]
    async fn scheme_name_is_case_insensitive() {
        let key = key();
        let tok = token(&key, "test-id-123", Utc::now().timestamp() + 3600);
        for prefix in ["bearer ", "BEARER ", "Bearer ", "BeArEr "] {
            let resp = call(app(key.clone()), Some(format!("{prefix}{tok}"))).await;
            assert_eq!(resp.status(), StatusCode::OK, "prefix {prefix:?}");
        }
        let resp = call(app(key), Some(format!("bear{tok}"))).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn missing_header_is_rejected() {
        let resp = call(app(key()), None).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    // ====================================================================
    // authorize
    // ====================================================================

    #[test]
    fn wrong_version_prefix_is_rejected() {
        let key = key();
        let tok = token(&key, "x", Utc::now().timestamp() + 60);
        let tok = tok.replacen("v01.", "v02.", 1);
        let err = authorize(&key, Some(&format!("Bearer {tok}"))).unwrap_err();
        assert!(matches!(err, AuthError::Version));
    }

    #[test]
    fn token_sealed_with_other_key_is_rejected() {
        let other = Encryption::new(&[7u8; 32]).unwrap();
        let tok = token(&other, "x", Utc::now().timestamp() + 60);
        let err = authorize(&key(), Some(&format!("Bearer {tok}"))).unwrap_err();
        assert!(matches!(err, AuthError::Decrypt(EncryptionError::Open)));
    }

    #[test]
    fn empty_id_is_rejected() {
        let key = key();
        let tok = token(&key, "", Utc::now().timestamp() + 60);
        let err = authorize(&key, Some(&format!("Bearer {tok}"))).unwrap_err();
        assert!(matches!(err, AuthError::MissingId));
    }

    #[test]
    fn garbage_plaintext_is_rejected() {
        let key = key();
        let tok = format!("v01.{}", key.encrypt(b"not json").unwrap());
        let err = authorize(&key, Some(&format!("Bearer {tok}"))).unwrap_err();
        assert!(matches!(err, AuthError::Claims(_)));
    }
}
