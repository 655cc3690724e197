//! OAuth 2.0 `refresh_token` grant.

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::debug;

use crate::credentials::{ClientProfile, RefreshError, TokenMaterial, TokenRefresher};

/// Token endpoint used when the client profile does not name one.
pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

/// Refreshes tokens against the profile's token endpoint.
#[derive(Debug, Clone, Default)]
pub struct OAuthRefresher {
    client: reqwest::Client,
}

impl OAuthRefresher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TokenRefresher for OAuthRefresher {
    async fn refresh(
        &self,
        profile: &ClientProfile,
        token: &TokenMaterial,
    ) -> Result<TokenMaterial, RefreshError> {
        let refresh_token = token
            .refresh_token
            .as_ref()
            .ok_or(RefreshError::MissingRefreshToken)?;
        let token_uri = profile.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI);

        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.expose_secret().clone()),
            ("client_id", profile.client_id.clone()),
        ];
        if let Some(secret) = &profile.client_secret {
            form.push(("client_secret", secret.expose_secret().clone()));
        }

        debug!(client_id = %profile.client_id, token_uri, "refreshing access token");
        let response = self
            .client
            .post(token_uri)
            .form(&form)
            .send()
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let reason = serde_json::from_str::<TokenErrorResponse>(&body)
                .map(|e| match e.error_description {
                    Some(desc) => format!("{}: {desc}", e.error),
                    None => e.error,
                })
                .unwrap_or_else(|_| format!("HTTP {status}"));
            return Err(if status.is_server_error() {
                RefreshError::Transport(reason)
            } else {
                RefreshError::Rejected(reason)
            });
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;

        let expires_at = match parsed.expires_in {
            Some(secs) => Some(
                TimeDelta::try_seconds(secs)
                    .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
                    .ok_or_else(|| {
                        RefreshError::InvalidResponse(format!("expires_in out of range: {secs}"))
                    })?,
            ),
            None => None,
        };
        Ok(TokenMaterial::new(
            parsed.access_token,
            parsed.refresh_token,
            expires_at,
        ))
    }
}
