//! Request secret validation.

use std::fmt;

use axum::http::HeaderMap;
use hex::decode as hex_decode;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const GITLAB_TOKEN_HEADER: &str = "X-Gitlab-Token";
pub const GITHUB_SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretRejection {
    Missing,
    BadToken(String),
    BadSignature,
}

impl fmt::Display for SecretRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretRejection::Missing => write!(f, "no secret"),
            SecretRejection::BadToken(token) => write!(f, "bad secret [{}]", token),
            SecretRejection::BadSignature => write!(f, "bad signature"),
        }
    }
}

/// Check a request against the hook's secret. Either a GitLab token equal to
/// the secret or a GitHub HMAC signature of the body is accepted.
pub fn verify_request(secret: &str, headers: &HeaderMap, body: &[u8]) -> Result<(), SecretRejection> {
    if let Some(token) = header_str(headers, GITLAB_TOKEN_HEADER) {
        return if token == secret {
            Ok(())
        } else {
            Err(SecretRejection::BadToken(token.to_string()))
        };
    }

    if let Some(signature) = header_str(headers, GITHUB_SIGNATURE_HEADER) {
        return if verify_github_signature(secret, body, signature) {
            Ok(())
        } else {
            Err(SecretRejection::BadSignature)
        };
    }

    Err(SecretRejection::Missing)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

/// Verify a GitHub `sha256=<hex>` signature header.
pub fn verify_github_signature(secret: &str, payload: &[u8], signature_header: &str) -> bool {
    let Some(signature) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(signature) = hex_decode(signature) else {
        return false;
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);
    // Constant-time comparison
    mac.verify_slice(&signature).is_ok()
}

#[cfg(test)]
pub(crate) fn sign(secret: &str, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}
