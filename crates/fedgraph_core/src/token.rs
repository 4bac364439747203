/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Short-lived delivery bearer tokens: compact JWS, RS256, signed with the
//! sending actor's key.

use crate::http_sig::{sign_bytes_rsa_sha256, verify_bytes_rsa_sha256};
use crate::keys::ActorKey;
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as B64URL, Engine as _};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
    kid: String,
}

pub fn issue_token(key: &ActorKey, audience: &str, ttl_secs: u64) -> Result<String> {
    let now = now_secs();
    let header = Header {
        alg: "RS256".to_string(),
        typ: "JWT".to_string(),
        kid: key.key_id.clone(),
    };
    let claims = TokenClaims {
        iss: key.actor_id.clone(),
        sub: key.actor_id.clone(),
        aud: audience.to_string(),
        iat: now,
        exp: now + ttl_secs as i64,
    };
    let signing_input = format!(
        "{}.{}",
        B64URL.encode(serde_json::to_vec(&header)?),
        B64URL.encode(serde_json::to_vec(&claims)?)
    );
    let sig = sign_bytes_rsa_sha256(&key.private_key_pem, signing_input.as_bytes())?;
    Ok(format!("{signing_input}.{}", B64URL.encode(sig)))
}

/// Claims without checking the signature; used to pick the verification key.
pub fn peek_claims(token: &str) -> Result<TokenClaims> {
    let mut parts = token.split('.');
    let (Some(_), Some(payload), Some(_), None) = (parts.next(), parts.next(), parts.next(), parts.next()) else {
        return Err(anyhow!("malformed token"));
    };
    let bytes = B64URL.decode(payload).context("decode token claims")?;
    serde_json::from_slice(&bytes).context("parse token claims")
}

pub fn verify_token(token: &str, public_key_pem: &str, expected_audience: &str) -> Result<TokenClaims> {
    let (signing_input, sig_b64) = token
        .rsplit_once('.')
        .ok_or_else(|| anyhow!("malformed token"))?;
    let (header_b64, _) = signing_input
        .split_once('.')
        .ok_or_else(|| anyhow!("malformed token"))?;
    let header: Header = serde_json::from_slice(&B64URL.decode(header_b64).context("decode token header")?)
        .context("parse token header")?;
    if header.alg != "RS256" {
        return Err(anyhow!("unsupported token alg: {}", header.alg));
    }
    let sig = B64URL.decode(sig_b64).context("decode token signature")?;
    verify_bytes_rsa_sha256(public_key_pem, signing_input.as_bytes(), &sig)?;

    let claims = peek_claims(token)?;
    if claims.aud != expected_audience {
        return Err(anyhow!("token audience mismatch"));
    }
    if claims.exp < now_secs() {
        return Err(anyhow!("token expired"));
    }
    Ok(claims)
}

fn now_secs() -> i64 {
    crate::object::now_ms() / 1000
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_key_pair;

    fn key() -> ActorKey {
        let (private_key_pem, public_key_pem) = generate_key_pair(1024).unwrap();
        ActorKey {
            actor_id: "https://a.example/users/alice".into(),
            key_id: "https://a.example/users/alice#key".into(),
            private_key_pem,
            public_key_pem,
        }
    }

    #[test]
    fn token_names_sender_and_destination() {
        let k = key();
        let t = issue_token(&k, "https://b.example/inbox", 60).unwrap();
        let claims = verify_token(&t, &k.public_key_pem, "https://b.example/inbox").unwrap();
        assert_eq!(claims.iss, k.actor_id);
        assert_eq!(claims.aud, "https://b.example/inbox");
        assert!(verify_token(&t, &k.public_key_pem, "https://c.example/inbox").is_err());
    }

    #[test]
    fn other_key_does_not_verify() {
        let a = key();
        let b = key();
        let t = issue_token(&a, "https://b.example/inbox", 60).unwrap();
        assert!(verify_token(&t, &b.public_key_pem, "https://b.example/inbox").is_err());
    }
}
