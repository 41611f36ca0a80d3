// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Scoped data-plane access tokens.
//!
//! Compact signed tokens bind `{org, sandbox, worker}` for direct
//! worker access. Format: `v1.<hex payload>.<hex signature>` where the
//! signature is SHA-256 over `secret.payload`. Workers verify with the
//! shared secret; no token state is stored anywhere.

use crate::{OrgId, SandboxId, WorkerId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use std::time::Duration;

/// Token lifetime.
pub const TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("bad signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
}

/// Claims carried by a scoped token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopedToken {
    pub org_id: OrgId,
    pub sandbox_id: SandboxId,
    pub worker_id: WorkerId,
    pub expires_at_ms: u64,
}

impl ScopedToken {
    /// Issue claims expiring [`TOKEN_TTL`] from `now_ms`.
    pub fn issue(org_id: OrgId, sandbox_id: SandboxId, worker_id: WorkerId, now_ms: u64) -> Self {
        Self {
            org_id,
            sandbox_id,
            worker_id,
            expires_at_ms: now_ms + TOKEN_TTL.as_millis() as u64,
        }
    }

    /// Serialize and sign with the shared secret.
    pub fn sign(&self, secret: &str) -> String {
        // Claims are a flat struct of strings and one integer; JSON
        // serialization cannot fail.
        let payload = serde_json::to_vec(self).unwrap_or_default();
        let sig = signature(secret, &payload);
        format!("v1.{}.{}", hex_encode(&payload), hex_encode(&sig))
    }

    /// Parse, check the signature, and check expiry.
    pub fn verify(token: &str, secret: &str, now_ms: u64) -> Result<Self, TokenError> {
        let mut parts = token.splitn(3, '.');
        let (version, payload_hex, sig_hex) = match (parts.next(), parts.next(), parts.next()) {
            (Some(v), Some(p), Some(s)) => (v, p, s),
            _ => return Err(TokenError::Malformed),
        };
        if version != "v1" {
            return Err(TokenError::Malformed);
        }
        let payload = hex_decode(payload_hex).ok_or(TokenError::Malformed)?;
        let sig = hex_decode(sig_hex).ok_or(TokenError::Malformed)?;
        if signature(secret, &payload) != sig {
            return Err(TokenError::BadSignature);
        }
        let claims: ScopedToken =
            serde_json::from_slice(&payload).map_err(|_| TokenError::Malformed)?;
        if now_ms >= claims.expires_at_ms {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }
}

fn signature(secret: &str, payload: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(b".");
    hasher.update(payload);
    hasher.finalize().to_vec()
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

#[cfg(test)]
#[path = "token_tests.rs"]
mod tests;
