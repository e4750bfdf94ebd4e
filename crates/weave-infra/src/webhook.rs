//! Webhook authentication with HMAC-SHA256, bearer token, and API key
//! verification.
//!
//! Provides:
//! - `verify_hmac_sha256()` -- constant-time HMAC-SHA256 signature verification
//! - `verify_bearer_token()` -- constant-time bearer token comparison
//! - `WebhookRegistry` -- DashMap-backed registry for path -> webhook config lookup

use std::sync::Arc;

use dashmap::DashMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;
use weave_types::workflow::WebhookAuth;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the HMAC signature of the raw body.
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during webhook handling.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// HMAC signature verification failed.
    #[error("HMAC signature verification failed")]
    HmacVerificationFailed,

    /// Bearer token or API key verification failed.
    #[error("credential verification failed")]
    CredentialVerificationFailed,

    /// No webhook registered at the given path.
    #[error("no webhook registered at path: {0}")]
    PathNotFound(String),

    /// Invalid HMAC key.
    #[error("invalid HMAC key: {0}")]
    InvalidKey(String),

    /// Missing authentication header.
    #[error("missing authentication: {0}")]
    MissingAuth(String),
}

// ---------------------------------------------------------------------------
// HMAC-SHA256 verification
// ---------------------------------------------------------------------------

/// Verify an HMAC-SHA256 signature against a request body.
///
/// Uses constant-time comparison to prevent timing attacks.
pub fn verify_hmac_sha256(
    secret: &[u8],
    body: &[u8],
    signature_hex: &str,
) -> Result<(), WebhookError> {
    let expected_bytes =
        hex_decode(signature_hex).map_err(|_| WebhookError::HmacVerificationFailed)?;

    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|e| WebhookError::InvalidKey(e.to_string()))?;
    mac.update(body);

    // Constant-time verification (via hmac crate's `verify_slice`)
    mac.verify_slice(&expected_bytes)
        .map_err(|_| WebhookError::HmacVerificationFailed)
}

/// Verify an HMAC-SHA256 signature with an optional `sha256=` prefix.
///
/// GitHub-style webhooks send signatures as `sha256=<hex>`. This function
/// handles both prefixed and plain hex signatures.
pub fn verify_hmac_sha256_with_prefix(
    secret: &[u8],
    body: &[u8],
    signature: &str,
) -> Result<(), WebhookError> {
    let hex_sig = signature.strip_prefix("sha256=").unwrap_or(signature);
    verify_hmac_sha256(secret, body, hex_sig)
}

// ---------------------------------------------------------------------------
// Token verification
// ---------------------------------------------------------------------------

/// Verify a bearer token using constant-time comparison.
///
/// The `provided` token may carry a "Bearer " prefix.
pub fn verify_bearer_token(expected: &str, provided: &str) -> Result<(), WebhookError> {
    let token = provided.strip_prefix("Bearer ").unwrap_or(provided);

    if constant_time_eq(expected.as_bytes(), token.as_bytes()) {
        Ok(())
    } else {
        Err(WebhookError::CredentialVerificationFailed)
    }
}

/// Verify a static API key using constant-time comparison.
pub fn verify_api_key(expected: &str, provided: &str) -> Result<(), WebhookError> {
    if constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
        Ok(())
    } else {
        Err(WebhookError::CredentialVerificationFailed)
    }
}

// ---------------------------------------------------------------------------
// WebhookRoute
// ---------------------------------------------------------------------------

/// Configuration for a registered webhook endpoint.
#[derive(Debug, Clone)]
pub struct WebhookRoute {
    /// The workflow definition this webhook triggers.
    pub definition_id: Uuid,
    /// Workflow name (for logging).
    pub workflow_name: String,
    /// Authentication method, `None` for open endpoints.
    pub auth: Option<WebhookAuth>,
}

// ---------------------------------------------------------------------------
// WebhookRegistry
// ---------------------------------------------------------------------------

/// Thread-safe registry mapping webhook paths to route configurations.
///
/// Uses `DashMap` for concurrent read/write access without locking the
/// entire registry. Paths are normalized (always start with `/`).
pub struct WebhookRegistry {
    routes: Arc<DashMap<String, WebhookRoute>>,
}

impl WebhookRegistry {
    /// Create a new empty webhook registry.
    pub fn new() -> Self {
        Self {
            routes: Arc::new(DashMap::new()),
        }
    }

    /// Register a webhook at the given path.
    ///
    /// If a webhook already exists at this path, it is replaced.
    pub fn register(&self, path: &str, route: WebhookRoute) {
        let normalized = normalize_path(path);
        tracing::info!(
            path = %normalized,
            definition_id = %route.definition_id,
            "registered webhook"
        );
        self.routes.insert(normalized, route);
    }

    /// Unregister a webhook at the given path.
    ///
    /// Returns the removed route if one was registered.
    pub fn unregister(&self, path: &str) -> Option<WebhookRoute> {
        let normalized = normalize_path(path);
        self.routes.remove(&normalized).map(|(_, v)| v)
    }

    /// Unregister every webhook owned by a workflow definition.
    pub fn unregister_definition(&self, definition_id: &Uuid) {
        self.routes
            .retain(|_, route| route.definition_id != *definition_id);
    }

    /// Look up a webhook route by path.
    pub fn lookup(&self, path: &str) -> Result<WebhookRoute, WebhookError> {
        let normalized = normalize_path(path);
        self.routes
            .get(&normalized)
            .map(|r| r.value().clone())
            .ok_or(WebhookError::PathNotFound(normalized))
    }

    /// Get the number of registered webhooks.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// List all registered paths.
    pub fn paths(&self) -> Vec<String> {
        self.routes.iter().map(|r| r.key().clone()).collect()
    }

    /// Verify authentication for an incoming webhook request.
    ///
    /// Looks up the route for the given path, then verifies the request
    /// against the configured authentication method. `header` resolves
    /// request headers by lowercase name.
    pub fn verify_request(
        &self,
        path: &str,
        body: &[u8],
        header: impl Fn(&str) -> Option<String>,
    ) -> Result<WebhookRoute, WebhookError> {
        let route = self.lookup(path)?;

        match &route.auth {
            Some(WebhookAuth::HmacSha256 { secret }) => {
                let sig = header(SIGNATURE_HEADER).ok_or_else(|| {
                    WebhookError::MissingAuth(format!("{SIGNATURE_HEADER} header required"))
                })?;
                verify_hmac_sha256_with_prefix(secret.as_bytes(), body, &sig)?;
            }
            Some(WebhookAuth::BearerToken { token }) => {
                let auth = header("authorization").ok_or_else(|| {
                    WebhookError::MissingAuth("Authorization header required".to_string())
                })?;
                verify_bearer_token(token, &auth)?;
            }
            Some(WebhookAuth::ApiKey { header: name, key }) => {
                let provided = header(&name.to_lowercase()).ok_or_else(|| {
                    WebhookError::MissingAuth(format!("{name} header required"))
                })?;
                verify_api_key(key, &provided)?;
            }
            None => {
                // Open endpoint.
            }
        }

        Ok(route)
    }
}

impl Default for WebhookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Normalize a webhook path: ensure it starts with `/` and has no trailing slash.
fn normalize_path(path: &str) -> String {
    let mut normalized = path.to_string();
    if !normalized.starts_with('/') {
        normalized = format!("/{normalized}");
    }
    if normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

/// Decode a hex string to bytes.
fn hex_decode(hex: &str) -> Result<Vec<u8>, ()> {
    if hex.len() % 2 != 0 {
        return Err(());
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| ()))
        .collect()
}

/// Encode bytes to a lowercase hex string.
fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Constant-time byte comparison (XOR-based).
///
/// Returns true if and only if `a == b`. Time taken is independent of
/// how many bytes match (mitigates timing attacks).
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Compute HMAC-SHA256 and return hex-encoded signature.
///
/// Useful for generating test vectors and webhook signatures.
pub fn compute_hmac_sha256_hex(secret: &[u8], body: &[u8]) -> Result<String, WebhookError> {
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|e| WebhookError::InvalidKey(e.to_string()))?;
    mac.update(body);
    let result = mac.finalize();
    Ok(hex_encode(&result.into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    // -------------------------------------------------------------------
    // HMAC-SHA256 verification
    // -------------------------------------------------------------------

    #[test]
    fn test_verify_hmac_sha256_valid() {
        let secret = b"my-webhook-secret";
        let body = b"Hello, world!";

        let sig = compute_hmac_sha256_hex(secret, body).unwrap();
        assert!(verify_hmac_sha256(secret, body, &sig).is_ok());
    }

    #[test]
    fn test_verify_hmac_sha256_invalid_signature() {
        let secret = b"my-webhook-secret";
        let body = b"Hello, world!";

        let sig = compute_hmac_sha256_hex(secret, b"different body").unwrap();
        assert!(matches!(
            verify_hmac_sha256(secret, body, &sig),
            Err(WebhookError::HmacVerificationFailed)
        ));
    }

    #[test]
    fn test_verify_hmac_sha256_wrong_secret() {
        let body = b"payload";
        let sig = compute_hmac_sha256_hex(b"secret-a", body).unwrap();
        assert!(verify_hmac_sha256(b"secret-b", body, &sig).is_err());
    }

    #[test]
    fn test_verify_hmac_sha256_bad_hex() {
        assert!(verify_hmac_sha256(b"secret", b"body", "not-hex").is_err());
        assert!(verify_hmac_sha256(b"secret", b"body", "abc").is_err());
    }

    #[test]
    fn test_verify_hmac_sha256_with_prefix() {
        let secret = b"my-webhook-secret";
        let body = b"{\"event\": \"push\"}";

        let sig = compute_hmac_sha256_hex(secret, body).unwrap();
        let prefixed = format!("sha256={sig}");
        assert!(verify_hmac_sha256_with_prefix(secret, body, &prefixed).is_ok());
        assert!(verify_hmac_sha256_with_prefix(secret, body, &sig).is_ok());
    }

    // RFC 4231 test case 2: key "Jefe", data "what do ya want for nothing?"
    #[test]
    fn test_hmac_sha256_rfc4231_vector() {
        let sig = compute_hmac_sha256_hex(b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            sig,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    // -------------------------------------------------------------------
    // Bearer token / API key verification
    // -------------------------------------------------------------------

    #[test]
    fn test_verify_bearer_token_valid() {
        assert!(verify_bearer_token("tok-123", "Bearer tok-123").is_ok());
        assert!(verify_bearer_token("tok-123", "tok-123").is_ok());
    }

    #[test]
    fn test_verify_bearer_token_invalid() {
        assert!(verify_bearer_token("tok-123", "Bearer tok-999").is_err());
        assert!(verify_bearer_token("tok-123", "").is_err());
    }

    #[test]
    fn test_verify_api_key() {
        assert!(verify_api_key("k-1", "k-1").is_ok());
        assert!(verify_api_key("k-1", "k-2").is_err());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"same", b"same"));
        assert!(!constant_time_eq(b"same", b"diff"));
        assert!(!constant_time_eq(b"short", b"longer"));
        assert!(constant_time_eq(b"", b""));
    }

    // -------------------------------------------------------------------
    // Registry
    // -------------------------------------------------------------------

    fn route(auth: Option<WebhookAuth>) -> WebhookRoute {
        WebhookRoute {
            definition_id: Uuid::now_v7(),
            workflow_name: "triage".to_string(),
            auth,
        }
    }

    #[test]
    fn test_registry_register_lookup_unregister() {
        let registry = WebhookRegistry::new();
        assert!(registry.is_empty());

        registry.register("/hooks/tickets", route(None));
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup("/hooks/tickets").is_ok());
        // Lookup normalizes missing leading slash and trailing slash.
        assert!(registry.lookup("hooks/tickets").is_ok());
        assert!(registry.lookup("/hooks/tickets/").is_ok());

        assert!(registry.unregister("/hooks/tickets").is_some());
        assert!(matches!(
            registry.lookup("/hooks/tickets"),
            Err(WebhookError::PathNotFound(_))
        ));
    }

    #[test]
    fn test_verify_request_hmac() {
        let registry = WebhookRegistry::new();
        registry.register(
            "/hooks/gh",
            route(Some(WebhookAuth::HmacSha256 {
                secret: "s3cret".to_string(),
            })),
        );

        let body = b"{\"ref\": \"main\"}";
        let sig = format!(
            "sha256={}",
            compute_hmac_sha256_hex(b"s3cret", body).unwrap()
        );

        let ok = registry.verify_request("/hooks/gh", body, |name| {
            (name == SIGNATURE_HEADER).then(|| sig.clone())
        });
        assert!(ok.is_ok());

        let missing = registry.verify_request("/hooks/gh", body, |_| None);
        assert!(matches!(missing, Err(WebhookError::MissingAuth(_))));

        let bad = registry.verify_request("/hooks/gh", body, |name| {
            (name == SIGNATURE_HEADER).then(|| "sha256=deadbeef".to_string())
        });
        assert!(matches!(bad, Err(WebhookError::HmacVerificationFailed)));
    }

    #[test]
    fn test_verify_request_api_key() {
        let registry = WebhookRegistry::new();
        registry.register(
            "/hooks/crm",
            route(Some(WebhookAuth::ApiKey {
                header: "X-Api-Key".to_string(),
                key: "k-42".to_string(),
            })),
        );

        let ok = registry.verify_request("/hooks/crm", b"{}", |name| {
            (name == "x-api-key").then(|| "k-42".to_string())
        });
        assert!(ok.is_ok());

        let bad = registry.verify_request("/hooks/crm", b"{}", |name| {
            (name == "x-api-key").then(|| "nope".to_string())
        });
        assert!(matches!(
            bad,
            Err(WebhookError::CredentialVerificationFailed)
        ));
    }

    #[test]
    fn test_verify_request_open_endpoint() {
        let registry = WebhookRegistry::new();
        registry.register("/hooks/open", route(None));
        assert!(registry.verify_request("/hooks/open", b"{}", |_| None).is_ok());
    }
}
