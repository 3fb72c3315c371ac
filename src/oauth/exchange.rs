//! Token exchange against the third-party provider.
//!
//! Every call builds its own request from scratch. Nothing here caches
//! tokens between calls; the only durable copy of a credential pair lives
//! encrypted in the identity store.

use super::provider::ProviderConfig;
use crate::store::{AccountProfile, CredentialPair};
use anyhow::{anyhow, Context, Result};
use chrono::{Duration, Utc};
use serde::Deserialize;
use std::collections::HashMap;

/// OAuth token response (standard OAuth 2.0)
#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

/// Provider profile response; only the fields the broker needs.
#[derive(Deserialize, Debug)]
struct ProfileResponse {
    id: String,
    #[serde(default)]
    display_name: Option<String>,
}

/// Exchange an authorization code for a fresh credential pair.
pub async fn exchange_code_for_pair(
    provider: &ProviderConfig,
    code: &str,
) -> Result<CredentialPair> {
    let mut form_data = HashMap::new();
    form_data.insert("grant_type", "authorization_code");
    form_data.insert("code", code);
    form_data.insert("redirect_uri", provider.redirect_uri.as_str());
    form_data.insert("client_id", provider.client_id.as_str());
    form_data.insert("client_secret", provider.client_secret.as_str());

    tracing::debug!("Exchanging authorization code at {}", provider.token_url);
    let token = post_token_request(&provider.token_url, &form_data).await?;

    Ok(CredentialPair {
        access_secret: token.access_token,
        refresh_secret: token.refresh_token,
        expires_at: token
            .expires_in
            .map(|seconds| Utc::now() + Duration::seconds(seconds)),
        granted_scopes: token.scope.unwrap_or_default(),
    })
}

/// Renew a credential pair via the refresh grant.
///
/// Providers may omit `refresh_token` and `scope` from refresh responses;
/// the previous values carry over so the pair stays renewable.
pub async fn refresh_credential_pair(
    provider: &ProviderConfig,
    current: CredentialPair,
) -> Result<CredentialPair> {
    let refresh_token = current
        .refresh_secret
        .clone()
        .ok_or_else(|| anyhow!("credential pair has no refresh token"))?;

    let mut form_data = HashMap::new();
    form_data.insert("grant_type", "refresh_token");
    form_data.insert("refresh_token", refresh_token.as_str());
    form_data.insert("client_id", provider.client_id.as_str());
    form_data.insert("client_secret", provider.client_secret.as_str());

    tracing::debug!("Refreshing credential pair at {}", provider.token_url);
    let token = post_token_request(&provider.token_url, &form_data).await?;

    Ok(CredentialPair {
        access_secret: token.access_token,
        refresh_secret: token.refresh_token.or(current.refresh_secret),
        expires_at: token
            .expires_in
            .map(|seconds| Utc::now() + Duration::seconds(seconds)),
        granted_scopes: token.scope.unwrap_or(current.granted_scopes),
    })
}

/// Fetch the provider profile for a freshly-issued access secret.
///
/// `display_name` falls back to the provider user id when the profile has
/// no name set.
pub async fn fetch_profile(provider: &ProviderConfig, access_secret: &str) -> Result<AccountProfile> {
    let client = reqwest::Client::new();

    let response = client
        .get(&provider.profile_url)
        .bearer_auth(access_secret)
        .header("Accept", "application/json")
        .send()
        .await
        .context("failed to send profile request")?;

    if !response.status().is_success() {
        return Err(anyhow!(
            "profile request failed with status {}",
            response.status()
        ));
    }

    let profile: ProfileResponse = response
        .json()
        .await
        .context("failed to parse profile response")?;

    let display_name = profile
        .display_name
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| profile.id.clone());

    Ok(AccountProfile {
        provider_user_id: profile.id,
        display_name,
    })
}

async fn post_token_request(
    token_url: &str,
    form_data: &HashMap<&str, &str>,
) -> Result<TokenResponse> {
    let client = reqwest::Client::new();

    let response = client
        .post(token_url)
        .header("Accept", "application/json")
        .form(form_data)
        .send()
        .await
        .context("failed to send token request")?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        return Err(anyhow!(
            "token request failed with status {}: {}",
            status,
            body
        ));
    }

    response
        .json::<TokenResponse>()
        .await
        .context("failed to parse token response")
}
