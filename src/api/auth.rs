//! Browser-facing OAuth routes plus Bearer-keyed account endpoints.
//!
//! The flow as a user sees it:
//! 1. GET /auth/login → Redirect to the provider's authorization page
//! 2. User authorizes on the provider's site
//! 3. Provider redirects to GET /auth/callback
//! 4. Callback exchanges the code, stores the sealed pair, registers the
//!    account handle, and shows an HTML page with the API key
//!
//! Adding a second account to an existing identity is the same flow started
//! with `?api_key=<existing key>&account_name=<name>`.

use crate::auth::extract_bearer_token;
use crate::handles::{AccountHandleRegistry, HandleError};
use crate::oauth::{FlowError, OAuthFlowManager, StateError};
use crate::store::{Identity, IdentityStore};
use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{Html, IntoResponse, Json, Redirect, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Application error types for auth endpoints
enum AppError {
    BadRequest(String),
    Unauthorized(String),
    ServerError(String),
    BadGateway(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::ServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            AppError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
        };

        let body = Json(ErrorResponse {
            error: error_message,
        });

        (status, body).into_response()
    }
}

/// Shared application state for the auth API
#[derive(Clone)]
pub struct AuthAppState {
    pub flow: Arc<OAuthFlowManager>,
    pub store: Arc<IdentityStore>,
    pub registry: Arc<AccountHandleRegistry>,
}

/// Login query parameters
#[derive(Deserialize)]
pub struct LoginParams {
    /// Name the authorized account registers under; defaults to "primary"
    account_name: Option<String>,
    /// Existing identity's API key when adding an account to it
    api_key: Option<String>,
}

/// Provider callback query parameters
#[derive(Deserialize)]
pub struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

/// One entry in the status response's account list
#[derive(Serialize)]
pub struct AccountSummary {
    account_name: String,
    handle: String,
    is_primary: bool,
}

/// GET /auth/status response body. Carries no secrets.
#[derive(Serialize)]
pub struct StatusResponse {
    authenticated: bool,
    identity_id: String,
    provider_user_id: String,
    display_name: String,
    needs_reauth: bool,
    created_at: DateTime<Utc>,
    last_active: DateTime<Utc>,
    accounts: Vec<AccountSummary>,
}

/// POST /auth/revoke response body
#[derive(Serialize)]
pub struct RevokeResponse {
    message: String,
    identity_id: String,
}

/// Create the auth API router
pub fn create_auth_router(state: AuthAppState) -> Router {
    Router::new()
        .route("/auth/login", get(auth_login))
        .route("/auth/callback", get(auth_callback))
        .route("/auth/status", get(auth_status))
        .route("/auth/revoke", post(auth_revoke))
        .with_state(Arc::new(state))
}

/// GET /auth/login
///
/// Starts the authorization flow by redirecting to the provider.
///
/// # Security
/// - `api_key`, when present, must match an existing identity; the new
///   account then registers under that identity instead of its own
/// - The `state` parameter is signed and single-use
async fn auth_login(
    State(state): State<Arc<AuthAppState>>,
    Query(params): Query<LoginParams>,
) -> Result<Redirect, AppError> {
    let account_name = params
        .account_name
        .unwrap_or_else(|| "primary".to_string());
    debug!(account_name = %account_name, "Login requested");

    let origin_identity = match params.api_key.as_deref() {
        Some(key) => {
            let identity = lookup_api_key(&state.store, key)?;
            Some(identity.identity_id)
        }
        None => None,
    };

    let (authorize_url, _) = state
        .flow
        .build_authorization_url(&account_name, origin_identity.as_deref())
        .map_err(|e| {
            error!(error = %e, "Failed to build authorization URL");
            AppError::ServerError("Failed to start authorization".to_string())
        })?;

    info!(
        account_name = %account_name,
        add_account = origin_identity.is_some(),
        "Redirecting to provider authorization page"
    );

    Ok(Redirect::temporary(&authorize_url))
}

/// GET /auth/callback
///
/// Completes the authorization flow: verifies the state, exchanges the
/// code, stores the sealed credential pair, registers the account handle,
/// and renders the API key page.
///
/// # Security
/// - State signature, TTL, and single-use checked before anything else
/// - A denied authorization never reaches the exchange
async fn auth_callback(
    State(state): State<Arc<AuthAppState>>,
    Query(params): Query<CallbackParams>,
) -> Result<Response, AppError> {
    if let Some(error) = params.error {
        warn!(error = %error, "Provider denied authorization");
        return Ok((StatusCode::BAD_REQUEST, Html(denied_page(&error))).into_response());
    }

    let code = params
        .code
        .ok_or_else(|| AppError::BadRequest("Missing 'code' parameter".to_string()))?;
    let raw_state = params
        .state
        .ok_or_else(|| AppError::BadRequest("Missing 'state' parameter".to_string()))?;

    let outcome = state
        .flow
        .complete_callback(&code, &raw_state)
        .await
        .map_err(|e| match e {
            FlowError::State(StateError::Expired) => {
                AppError::BadRequest("OAuth state expired, restart the login flow".to_string())
            }
            FlowError::State(StateError::Invalid) => {
                AppError::BadRequest("Invalid OAuth state, restart the login flow".to_string())
            }
            FlowError::Provider(e) => {
                error!(error = %e, "Code exchange with provider failed");
                AppError::BadGateway(format!("Failed to complete authorization: {}", e))
            }
            FlowError::Store(e) => {
                error!(error = %e, "Failed to persist identity or credentials");
                AppError::ServerError("Failed to store credentials".to_string())
            }
        })?;

    // A first login registers the account under the new identity itself;
    // an add-account flow registers it under the identity that started it.
    let owner = outcome
        .origin_identity
        .clone()
        .unwrap_or_else(|| outcome.identity.identity_id.clone());
    let is_primary = outcome.origin_identity.is_none();

    let account = state
        .registry
        .register(
            &owner,
            &outcome.account_name,
            &outcome.identity.identity_id,
            is_primary,
        )
        .map_err(|e| match e {
            HandleError::InvalidName(detail) => AppError::BadRequest(detail),
            other => {
                error!(error = %other, "Failed to register account handle");
                AppError::ServerError("Failed to register account".to_string())
            }
        })?;

    // The API key only appears on a first login. An added account is used
    // through the origin identity's existing key and the handle above.
    let api_key = if is_primary {
        let key = outcome.identity.api_key.clone().ok_or_else(|| {
            error!(
                identity_id = %outcome.identity.identity_id,
                "Identity has no API key after callback"
            );
            AppError::ServerError("Identity has no API key".to_string())
        })?;
        Some(key)
    } else {
        None
    };

    info!(
        identity_id = %outcome.identity.identity_id,
        account_name = %account.account_name,
        is_primary = account.is_primary,
        "Authorization complete"
    );

    Ok(Html(success_page(
        &outcome.identity.display_name,
        api_key.as_deref(),
        &account.account_name,
        &account.handle,
    ))
    .into_response())
}

/// GET /auth/status
///
/// Returns identity metadata and the registered account list for the
/// Bearer API key. Never includes tokens or other secrets.
async fn auth_status(
    State(state): State<Arc<AuthAppState>>,
    headers: HeaderMap,
) -> Result<Json<StatusResponse>, AppError> {
    let api_key = extract_bearer_token(&headers)
        .map_err(|e| AppError::Unauthorized(format!("Invalid token: {}", e)))?;
    let identity = lookup_api_key(&state.store, &api_key)?;

    let accounts = state
        .registry
        .list(&identity.identity_id)
        .map_err(|e| {
            error!(identity_id = %identity.identity_id, error = %e, "Failed to list accounts");
            AppError::ServerError("Failed to list accounts".to_string())
        })?
        .into_iter()
        .map(|a| AccountSummary {
            account_name: a.account_name,
            handle: a.handle,
            is_primary: a.is_primary,
        })
        .collect();

    Ok(Json(StatusResponse {
        authenticated: true,
        identity_id: identity.identity_id,
        provider_user_id: identity.provider_user_id,
        display_name: identity.display_name,
        needs_reauth: identity.needs_reauth,
        created_at: identity.created_at,
        last_active: identity.last_active,
        accounts,
    }))
}

/// POST /auth/revoke
///
/// Revokes the Bearer API key's identity: nulls the key, deletes the
/// credential pair, and removes every handle that references it.
async fn auth_revoke(
    State(state): State<Arc<AuthAppState>>,
    headers: HeaderMap,
) -> Result<Json<RevokeResponse>, AppError> {
    let api_key = extract_bearer_token(&headers)
        .map_err(|e| AppError::Unauthorized(format!("Invalid token: {}", e)))?;
    let identity = lookup_api_key(&state.store, &api_key)?;

    state.store.revoke_identity(&identity.identity_id).map_err(|e| {
        error!(identity_id = %identity.identity_id, error = %e, "Revocation failed");
        AppError::ServerError("Failed to revoke access".to_string())
    })?;

    info!(identity_id = %identity.identity_id, "Access revoked");

    Ok(Json(RevokeResponse {
        message: "Access revoked successfully".to_string(),
        identity_id: identity.identity_id,
    }))
}

/// Resolves an API key to its identity or the appropriate error.
fn lookup_api_key(store: &IdentityStore, api_key: &str) -> Result<Identity, AppError> {
    store
        .find_by_api_key(api_key)
        .map_err(|e| {
            error!(error = %e, "API key lookup failed");
            AppError::ServerError("Failed to look up API key".to_string())
        })?
        .ok_or_else(|| {
            warn!("Request with unknown API key");
            AppError::Unauthorized("Invalid API key".to_string())
        })
}

/// Minimal escaping for values interpolated into the HTML pages. Display
/// names and account names are not under our control.
fn escape_html(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

fn success_page(
    display_name: &str,
    api_key: Option<&str>,
    account_name: &str,
    handle: &str,
) -> String {
    let key_section = match api_key {
        Some(key) => format!(
            "<h3>Your API key</h3>\n\
             <p><code>{}</code></p>\n\
             <p>Send it as <code>Authorization: Bearer &lt;key&gt;</code> on every request. \
             Keep it secret; it is shown only once.</p>",
            escape_html(key)
        ),
        None => "<p>The account was added to your existing identity. \
                 Keep using your current API key.</p>"
            .to_string(),
    };

    format!(
        "<!DOCTYPE html>\n\
         <html>\n\
         <head><title>Account connected</title></head>\n\
         <body>\n\
         <h1>Successfully connected</h1>\n\
         <p>Welcome, <strong>{}</strong>. Your account is registered as \
         <strong>{}</strong>.</p>\n\
         <p>Account handle: <code>{}</code></p>\n\
         {}\n\
         </body>\n\
         </html>",
        escape_html(display_name),
        escape_html(account_name),
        escape_html(handle),
        key_section
    )
}

fn denied_page(error: &str) -> String {
    format!(
        "<!DOCTYPE html>\n\
         <html>\n\
         <head><title>Authorization denied</title></head>\n\
         <body>\n\
         <h1>Authorization denied</h1>\n\
         <p>The provider reported: <code>{}</code></p>\n\
         <p><a href=\"/auth/login\">Try again</a></p>\n\
         </body>\n\
         </html>",
        escape_html(error)
    )
}
