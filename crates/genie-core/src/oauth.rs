//! Authorization-code bookkeeping for the OAuth 2.1 code flow with PKCE.
//!
//! Everything is in memory; nothing survives a restart. Token minting and
//! the HTTP surface live elsewhere.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub const CODE_TTL: Duration = Duration::from_secs(5 * 60);
pub const REQUEST_TTL: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_SCOPE: &str = "mcp:read mcp:write";

/// Millisecond wall clock. Injected so expiry can be tested without sleeping.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(start_millis),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(millis(by), Ordering::SeqCst);
    }

    pub fn set(&self, millis: i64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum CodeChallengeMethod {
    #[default]
    S256,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    #[default]
    Code,
}

/// Raw query parameters of an authorize call.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct AuthorizeParams {
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub response_type: Option<String>,
    pub scope: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub state: Option<String>,
}

/// Request waiting for user consent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthorizationRequest {
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: String,
    pub code_challenge: String,
    pub code_challenge_method: CodeChallengeMethod,
    pub state: String,
    pub response_type: ResponseType,
    pub created_at: i64,
}

impl AuthorizationRequest {
    pub fn from_params(params: AuthorizeParams, now_millis: i64) -> Result<Self, AuthorizeError> {
        let present = |value: Option<String>| value.filter(|value| !value.is_empty());
        let (Some(client_id), Some(redirect_uri), Some(response_type), Some(code_challenge), Some(state)) = (
            present(params.client_id),
            present(params.redirect_uri),
            present(params.response_type),
            present(params.code_challenge),
            present(params.state),
        ) else {
            return Err(AuthorizeError::MissingParameters);
        };
        if response_type != "code" {
            return Err(AuthorizeError::UnsupportedResponseType);
        }
        if let Some(method) = present(params.code_challenge_method) {
            if method != "S256" {
                return Err(AuthorizeError::UnsupportedChallengeMethod);
            }
        }
        Ok(Self {
            client_id,
            redirect_uri,
            scope: present(params.scope).unwrap_or_else(|| DEFAULT_SCOPE.to_string()),
            code_challenge,
            code_challenge_method: CodeChallengeMethod::S256,
            state,
            response_type: ResponseType::Code,
            created_at: now_millis,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthorizationCode {
    pub code: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: String,
    pub code_challenge: String,
    pub code_challenge_method: CodeChallengeMethod,
    pub used: bool,
    pub expires_at: i64,
    pub created_at: i64,
}

/// OAuth error body as returned to HTTP callers.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct OAuthErrorBody {
    pub error: &'static str,
    pub error_description: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthorizeError {
    #[error("Missing required parameters (client_id, redirect_uri, response_type, code_challenge, state)")]
    MissingParameters,
    #[error("Only response_type=code is supported")]
    UnsupportedResponseType,
    #[error("Only code_challenge_method=S256 is supported")]
    UnsupportedChallengeMethod,
}

impl AuthorizeError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthorizeError::MissingParameters | AuthorizeError::UnsupportedChallengeMethod => {
                "invalid_request"
            }
            AuthorizeError::UnsupportedResponseType => "unsupported_response_type",
        }
    }

    pub fn body(&self) -> OAuthErrorBody {
        OAuthErrorBody {
            error: self.code(),
            error_description: self.to_string(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("Missing required parameters: code, redirect_uri, client_id, code_verifier")]
    MissingParameters,
    #[error("Invalid or expired authorization code, or PKCE validation failed")]
    InvalidGrant,
}

impl TokenError {
    pub fn code(&self) -> &'static str {
        match self {
            TokenError::MissingParameters => "invalid_request",
            TokenError::InvalidGrant => "invalid_grant",
        }
    }

    pub fn body(&self) -> OAuthErrorBody {
        OAuthErrorBody {
            error: self.code(),
            error_description: self.to_string(),
        }
    }
}

/// Body of an `authorization_code` token request.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct TokenRequest {
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub client_id: Option<String>,
    pub code_verifier: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OAuthStats {
    pub pending_requests: usize,
    pub active_codes: usize,
    pub used_codes: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub codes: usize,
    pub requests: usize,
}

impl CleanupReport {
    pub fn is_empty(&self) -> bool {
        self.codes == 0 && self.requests == 0
    }
}

/// `BASE64URL(SHA256(verifier))` without padding (RFC 7636 section 4.2).
pub fn pkce_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

pub fn verify_pkce(verifier: &str, challenge: &str) -> bool {
    pkce_challenge(verifier) == challenge
}

#[derive(Default)]
struct Maps {
    requests: HashMap<String, AuthorizationRequest>,
    codes: HashMap<String, AuthorizationCode>,
}

pub struct OAuthSessionManager {
    maps: Mutex<Maps>,
    clock: Arc<dyn Clock>,
}

impl Default for OAuthSessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl OAuthSessionManager {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            maps: Mutex::new(Maps::default()),
            clock,
        }
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    fn maps(&self) -> MutexGuard<'_, Maps> {
        self.maps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn store_authorization_request(&self, request_id: &str, request: AuthorizationRequest) {
        self.maps()
            .requests
            .insert(request_id.to_string(), request);
    }

    /// Expired requests read as absent and are dropped on the way out.
    pub fn get_authorization_request(&self, request_id: &str) -> Option<AuthorizationRequest> {
        let now = self.now_millis();
        let mut maps = self.maps();
        let expired = maps
            .requests
            .get(request_id)
            .map(|request| request_expired(request, now))?;
        if expired {
            maps.requests.remove(request_id);
            return None;
        }
        maps.requests.get(request_id).cloned()
    }

    pub fn remove_authorization_request(&self, request_id: &str) {
        self.maps().requests.remove(request_id);
    }

    pub fn generate_authorization_code(&self, request: &AuthorizationRequest) -> String {
        let code = Uuid::new_v4().to_string();
        let now = self.now_millis();
        let record = AuthorizationCode {
            code: code.clone(),
            client_id: request.client_id.clone(),
            redirect_uri: request.redirect_uri.clone(),
            scope: request.scope.clone(),
            code_challenge: request.code_challenge.clone(),
            code_challenge_method: request.code_challenge_method,
            used: false,
            expires_at: now.saturating_add(millis(CODE_TTL)),
            created_at: now,
        };
        self.maps().codes.insert(code.clone(), record);
        code
    }

    pub fn get_authorization_code(&self, code: &str) -> Option<AuthorizationCode> {
        self.maps().codes.get(code).cloned()
    }

    /// The only path that marks a code used. Every failure is `None`.
    pub fn validate_and_consume_code(
        &self,
        code: &str,
        client_id: &str,
        redirect_uri: &str,
        code_verifier: &str,
    ) -> Option<AuthorizationCode> {
        let now = self.now_millis();
        let mut maps = self.maps();
        let record = maps.codes.get_mut(code)?;
        if record.used {
            return None;
        }
        if now > record.expires_at {
            maps.codes.remove(code);
            return None;
        }
        if record.client_id != client_id || record.redirect_uri != redirect_uri {
            return None;
        }
        if !verify_pkce(code_verifier, &record.code_challenge) {
            return None;
        }
        record.used = true;
        Some(record.clone())
    }

    /// Drop every code past its expiry, used or not.
    pub fn cleanup_expired_codes(&self) -> usize {
        let now = self.now_millis();
        let mut maps = self.maps();
        let before = maps.codes.len();
        maps.codes.retain(|_, record| now <= record.expires_at);
        before - maps.codes.len()
    }

    pub fn cleanup_expired(&self) -> CleanupReport {
        let codes = self.cleanup_expired_codes();
        let now = self.now_millis();
        let mut maps = self.maps();
        let before = maps.requests.len();
        maps.requests.retain(|_, request| !request_expired(request, now));
        CleanupReport {
            codes,
            requests: before - maps.requests.len(),
        }
    }

    pub fn stats(&self) -> OAuthStats {
        let maps = self.maps();
        let used_codes = maps.codes.values().filter(|record| record.used).count();
        OAuthStats {
            pending_requests: maps.requests.len(),
            active_codes: maps.codes.len() - used_codes,
            used_codes,
        }
    }
}

fn request_expired(request: &AuthorizationRequest, now: i64) -> bool {
    now > request.created_at.saturating_add(millis(REQUEST_TTL))
}

/// Validate a token request and consume its code. Token minting is the caller's job.
pub fn exchange_authorization_code(
    manager: &OAuthSessionManager,
    request: &TokenRequest,
) -> Result<AuthorizationCode, TokenError> {
    let field = |value: &Option<String>| value.clone().filter(|value| !value.is_empty());
    let (Some(code), Some(redirect_uri), Some(client_id), Some(code_verifier)) = (
        field(&request.code),
        field(&request.redirect_uri),
        field(&request.client_id),
        field(&request.code_verifier),
    ) else {
        return Err(TokenError::MissingParameters);
    };
    manager
        .validate_and_consume_code(&code, &client_id, &redirect_uri, &code_verifier)
        .ok_or(TokenError::InvalidGrant)
}
