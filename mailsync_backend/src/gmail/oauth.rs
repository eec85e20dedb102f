use chrono::{DateTime, Duration, Utc};
use reqwest::Url;
use serde::Deserialize;

use crate::error::ServiceError;
use crate::models::Credentials;

const AUTH_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
const PROFILE_ENDPOINT: &str = "https://gmail.googleapis.com/gmail/v1/users/me/profile";

const SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/gmail.readonly",
    "https://www.googleapis.com/auth/gmail.send",
    "https://www.googleapis.com/auth/gmail.modify",
];

#[derive(Clone)]
pub struct GoogleOAuth {
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileResponse {
    email_address: String,
}

impl GoogleOAuth {
    pub fn new(
        client_id: String,
        client_secret: String,
        redirect_uri: String,
        http: reqwest::Client,
    ) -> Self {
        Self {
            client_id,
            client_secret,
            redirect_uri,
            http,
        }
    }

    /// Consent screen URL. `state` round-trips back to the callback.
    pub fn consent_url(&self, state: &str) -> Result<String, ServiceError> {
        let scope = SCOPES.join(" ");
        let url = Url::parse_with_params(
            AUTH_ENDPOINT,
            &[
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("response_type", "code"),
                ("scope", scope.as_str()),
                ("access_type", "offline"),
                ("prompt", "consent"),
                ("state", state),
            ],
        )
        .map_err(|e| ServiceError::Permanent(format!("invalid auth endpoint: {}", e)))?;
        Ok(url.to_string())
    }

    pub async fn exchange_code(&self, code: &str) -> Result<Credentials, ServiceError> {
        let token = self
            .token_request(&[
                ("code", code),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("grant_type", "authorization_code"),
            ])
            .await?;

        Ok(Credentials {
            expires_at: expiry_from(token.expires_in),
            access_token: token.access_token,
            refresh_token: token.refresh_token.unwrap_or_default(),
        })
    }

    /// Returns a fresh access token and its expiry.
    pub async fn refresh(
        &self,
        refresh_token: &str,
    ) -> Result<(String, Option<DateTime<Utc>>), ServiceError> {
        if refresh_token.trim().is_empty() {
            return Err(ServiceError::Auth("no refresh token stored".to_string()));
        }
        let token = self
            .token_request(&[
                ("refresh_token", refresh_token),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .await?;
        Ok((token.access_token, expiry_from(token.expires_in)))
    }

    pub async fn profile_email(&self, access_token: &str) -> Result<String, ServiceError> {
        let response = self
            .http
            .get(PROFILE_ENDPOINT)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| ServiceError::from_transport("gmail profile", &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::from_status("gmail profile", status, &body));
        }

        let profile: ProfileResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::Permanent(format!("gmail profile parse: {}", e)))?;
        Ok(profile.email_address)
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenResponse, ServiceError> {
        let response = self
            .http
            .post(TOKEN_ENDPOINT)
            .form(form)
            .send()
            .await
            .map_err(|e| ServiceError::from_transport("oauth token", &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_token_error(status, &body));
        }

        response
            .json()
            .await
            .map_err(|e| ServiceError::Permanent(format!("oauth token parse: {}", e)))
    }
}

fn expiry_from(expires_in: Option<i64>) -> Option<DateTime<Utc>> {
    expires_in.map(|secs| Utc::now() + Duration::seconds(secs))
}

/// `invalid_grant` means the refresh token was revoked or expired.
fn classify_token_error(status: reqwest::StatusCode, body: &str) -> ServiceError {
    match serde_json::from_str::<TokenErrorResponse>(body) {
        Ok(parsed) if parsed.error == "invalid_grant" || parsed.error == "unauthorized_client" => {
            ServiceError::Auth(format!(
                "oauth token: {} ({})",
                parsed.error,
                parsed.error_description.unwrap_or_default()
            ))
        }
        _ => ServiceError::from_status("oauth token", status, body),
    }
}
