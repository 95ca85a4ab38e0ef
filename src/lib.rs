#![warn(missing_docs)]
//!
//! This crate computes the `X-Signature` value an upstream chat API requires on every request. The signature is an HMAC-SHA256 over a request descriptor, keyed by a secondary key that is itself derived from a shared secret and a 5-minute time window.
//!
//! The user id that goes into the descriptor is read from the caller's bearer token **without verifying it**. Tokens that cannot be read fall back to the `guest-user` id instead of failing the request.
//!
//! ## Usage
//!
//! ```toml
//! [dependencies]
//! request-signer = "0.1"
//! ```
//!
use base64::alphabet;
use base64::engine::{GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use std::fmt;
use tracing::{debug, trace};

type HmacSha256 = Hmac<Sha256>;

/// Shared secret the upstream verifier expects. Only use it through [Signer::default].
pub const DEFAULT_SECRET: &str = "junjie";

/// User id signed in place of the token's `id` when the token cannot be read.
pub const FALLBACK_USER_ID: &str = "guest-user";

/// Length of one signing window in milliseconds.
pub const WINDOW_MILLIS: i64 = 5 * 60 * 1000;

/// Header the signature is sent in.
pub const SIGNATURE_HEADER: &str = "X-Signature";

// URL-safe alphabet, canonical padding, tolerant of non-zero trailing bits
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_allow_trailing_bits(true),
);

/// Decoded token payload: the claims object, untyped.
pub type Payload = serde_json::Map<String, Value>;

/// The error type for a token whose payload could not be read.
#[derive(Debug)]
pub enum TokenError {
    /// The token has fewer than two `.`-separated segments.
    Malformed,

    /// The payload segment is not valid base64url.
    Base64(base64::DecodeError),

    /// The decoded payload is not a JSON object.
    Json(serde_json::Error),

    /// The payload has no usable `id` claim.
    MissingId,
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenError::Malformed => write!(f, "token has no payload segment"),
            TokenError::Base64(e) => write!(f, "payload is not valid base64url: {}", e),
            TokenError::Json(e) => write!(f, "payload is not a JSON object: {}", e),
            TokenError::MissingId => write!(f, "payload has no id claim"),
        }
    }
}

impl std::error::Error for TokenError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TokenError::Base64(e) => Some(e),
            TokenError::Json(e) => Some(e),
            TokenError::Malformed | TokenError::MissingId => None,
        }
    }
}

/// Decode the payload (second) segment of a `header.payload.signature` token.
///
/// The token's own signature is **not** checked. Only the payload segment has to be present and well formed; the header and signature segments are ignored.
pub fn decode_payload(token: &str) -> Result<Payload, TokenError> {
    let segment = token.split('.').nth(1).ok_or(TokenError::Malformed)?;

    let mut padded = String::with_capacity(segment.len() + 3);
    padded.push_str(segment);
    for _ in 0..(4 - segment.len() % 4) % 4 {
        padded.push('=');
    }

    let bytes = URL_SAFE_LENIENT
        .decode(padded)
        .map_err(TokenError::Base64)?;

    serde_json::from_slice(&bytes).map_err(TokenError::Json)
}

/// Read the `id` claim from an unverified token.
///
/// String ids are returned as-is and numeric ids in their JSON form. Any other type counts as missing.
pub fn extract_user_id(token: &str) -> Result<String, TokenError> {
    let payload = decode_payload(token)?;

    match payload.get("id") {
        Some(Value::String(id)) => Ok(id.clone()),
        Some(Value::Number(id)) => Ok(id.to_string()),
        _ => Err(TokenError::MissingId),
    }
}

/// Build the descriptor string that leads the signed message.
pub fn descriptor(request_id: &str, timestamp: i64, user_id: &str) -> String {
    format!(
        "requestId,{},timestamp,{},user_id,{}",
        request_id, timestamp, user_id
    )
}

/// Index of the 5-minute window `timestamp` falls in (floor division).
pub fn window_index(timestamp: i64) -> i64 {
    timestamp.div_euclid(WINDOW_MILLIS)
}

fn hmac_hex(key: &[u8], message: &[u8]) -> String {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

/// A computed request signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Lowercase hex HMAC-SHA256, always 64 characters.
    pub signature: String,

    /// The millisecond timestamp that was signed, unchanged.
    pub timestamp: i64,
}

/// A [Signature] together with the ids it was computed over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRequest {
    /// Caller-supplied request id.
    pub request_id: String,

    /// User id placed in the descriptor, either from the token or [FALLBACK_USER_ID].
    pub user_id: String,

    /// The signature itself.
    pub signature: Signature,
}

impl SignedRequest {
    /// Headers to attach to the outbound request.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        vec![(SIGNATURE_HEADER, self.signature.signature.clone())]
    }

    /// Query parameters the upstream checks the signature against, in the order it expects them.
    pub fn query_params(&self) -> Vec<(&'static str, String)> {
        let timestamp = self.signature.timestamp.to_string();
        vec![
            ("signature_timestamp", timestamp.clone()),
            ("requestId", self.request_id.clone()),
            ("timestamp", timestamp),
            ("user_id", self.user_id.clone()),
        ]
    }
}

/// Signer is the main entry point. Create with [Signer::new], or [Signer::default] for the upstream's built-in secret.
///
/// It can also be deserialized from a host configuration, e.g. `{"secret": "..."}`; a missing secret means [DEFAULT_SECRET].
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Signer {
    secret: String,
}

impl Default for Signer {
    fn default() -> Self {
        Signer::new(DEFAULT_SECRET)
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer").field("secret", &"..").finish()
    }
}

impl Signer {
    /// Creates a new [Signer] keyed with `secret`.
    pub fn new(secret: impl Into<String>) -> Self {
        Signer {
            secret: secret.into(),
        }
    }

    /// Sign a request on behalf of the user identified by `token`.
    ///
    /// If the token payload cannot be read, or has no `id`, the request is signed for [FALLBACK_USER_ID]. This never fails.
    ///
    /// ```rust
    /// use request_signer::Signer;
    ///
    /// let signer = Signer::default();
    ///
    /// // Not a readable token, so this is signed as "guest-user"
    /// let result = signer.sign_request("anonymous", "r1", 1_700_000_000_000, "hello");
    ///
    /// assert_eq!(
    ///     result.signature,
    ///     "d4018a5bf4452d2f7fd25a697f4ea26bf39588bb2a81b21f963427154ba64bfb"
    /// );
    /// assert_eq!(result.timestamp, 1_700_000_000_000);
    /// ```
    pub fn sign_request(
        &self,
        token: &str,
        request_id: &str,
        timestamp: i64,
        user_content: &str,
    ) -> Signature {
        self.prepare(token, request_id, timestamp, user_content)
            .signature
    }

    /// Same as [Signer::sign_request], but keeps the resolved user id so the caller can build the outbound request from [SignedRequest].
    pub fn prepare(
        &self,
        token: &str,
        request_id: &str,
        timestamp: i64,
        user_content: &str,
    ) -> SignedRequest {
        let user_id = match extract_user_id(token) {
            Ok(id) => {
                trace!("signing for user_id {}", id);
                id
            }
            Err(e) => {
                debug!("failed to read user id from token: {}, using {}", e, FALLBACK_USER_ID);
                FALLBACK_USER_ID.to_owned()
            }
        };

        let signature = self.sign_for_user(&user_id, request_id, timestamp, user_content);

        SignedRequest {
            request_id: request_id.to_owned(),
            user_id,
            signature,
        }
    }

    /// Sign a request for a user id the caller has already resolved.
    pub fn sign_for_user(
        &self,
        user_id: &str,
        request_id: &str,
        timestamp: i64,
        user_content: &str,
    ) -> Signature {
        let descriptor = descriptor(request_id, timestamp, user_id);
        self.sign(&descriptor, user_content, timestamp)
    }

    /// The key derived for the window `timestamp` falls in, as lowercase hex.
    pub fn window_key(&self, timestamp: i64) -> String {
        let index = window_index(timestamp).to_string();
        hmac_hex(self.secret.as_bytes(), index.as_bytes())
    }

    /// Sign `descriptor|message|timestamp` with the window key.
    ///
    /// This is the wire-level construction; [Signer::sign_request] builds the descriptor for you.
    pub fn sign(&self, descriptor: &str, message: &str, timestamp: i64) -> Signature {
        let signed = format!("{}|{}|{}", descriptor, message, timestamp);
        let key = self.window_key(timestamp);

        Signature {
            signature: hmac_hex(key.as_bytes(), signed.as_bytes()),
            timestamp,
        }
    }
}
