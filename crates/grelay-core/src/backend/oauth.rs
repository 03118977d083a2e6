//! Service-account OAuth: RS256 JWT assertion exchanged for a short-lived
//! access token, cached until close to expiry.

use std::time::{SystemTime, UNIX_EPOCH};

use http::StatusCode;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use tokio::sync::Mutex;

use crate::backend::BackendError;
use crate::settings::ServiceAccount;

pub(super) const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const DEFAULT_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Debug, serde::Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    exp: i64,
    iat: i64,
}

#[derive(Debug, serde::Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: i64,
}

#[derive(Debug, Default)]
pub(super) struct TokenCache {
    inner: Mutex<Option<CachedToken>>,
}

pub(super) async fn fetch_access_token(
    client: &reqwest::Client,
    cache: &TokenCache,
    account: &ServiceAccount,
) -> Result<String, BackendError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or_default();

    let mut guard = cache.inner.lock().await;
    if let Some(cached) = guard.as_ref()
        && now + EXPIRY_MARGIN_SECS < cached.expires_at
    {
        return Ok(cached.access_token.clone());
    }

    let token_uri = account.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI);
    let exp = now + 3600;
    let claims = JwtClaims {
        iss: &account.client_email,
        scope: DEFAULT_SCOPE,
        aud: token_uri,
        exp,
        iat: now,
    };
    let mut header = Header::new(Algorithm::RS256);
    if let Some(kid) = account.private_key_id.as_deref()
        && !kid.trim().is_empty()
    {
        header.kid = Some(kid.to_string());
    }
    let key = EncodingKey::from_rsa_pem(account.private_key.as_bytes()).map_err(|err| {
        BackendError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("invalid service account key: {err}"),
        )
    })?;
    let jwt = jsonwebtoken::encode(&header, &claims, &key).map_err(|err| {
        BackendError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("sign assertion: {err}"),
        )
    })?;

    let body = format!(
        "grant_type=urn:ietf:params:oauth:grant-type:jwt-bearer&assertion={}",
        urlencoding::encode(&jwt)
    );
    let response = client
        .post(token_uri)
        .header("Content-Type", "application/x-www-form-urlencoded")
        .body(body)
        .send()
        .await
        .map_err(|err| BackendError::new(StatusCode::BAD_GATEWAY, err.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(BackendError::new(
            status,
            format!("oauth token exchange failed: {text}"),
        ));
    }

    let token: OAuthTokenResponse = response
        .json()
        .await
        .map_err(|err| BackendError::new(StatusCode::BAD_GATEWAY, err.to_string()))?;
    let expires_at = now + token.expires_in.unwrap_or(3600);
    *guard = Some(CachedToken {
        access_token: token.access_token.clone(),
        expires_at,
    });
    Ok(token.access_token)
}
