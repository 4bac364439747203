/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! draft-cavage HTTP Signatures (rsa-sha256) plus the Digest and Date checks
//! that go with them.

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use http::{HeaderMap, Method, Uri};
use httpdate::parse_http_date;
use rsa::{
    pkcs1v15::{SigningKey, VerifyingKey},
    pkcs8::{DecodePrivateKey, DecodePublicKey},
    signature::{RandomizedSigner, SignatureEncoding, Verifier},
    RsaPrivateKey, RsaPublicKey,
};
use sha2::{Digest, Sha256};
use std::{collections::HashMap, time::Duration};

/// Headers covered by outbound deliveries.
pub const DELIVERY_SIGNED_HEADERS: &[&str] = &["(request-target)", "date", "authorization", "content-type"];
/// Headers covered by signed fetches.
pub const FETCH_SIGNED_HEADERS: &[&str] = &["(request-target)", "host", "date"];

#[derive(Debug)]
pub struct SignatureParams {
    pub key_id: String,
    pub algorithm: Option<String>,
    pub headers: Vec<String>,
    pub signature: Vec<u8>,
}

impl SignatureParams {
    /// Actor id the key belongs to (`<actor>#key` -> `<actor>`).
    pub fn actor_id(&self) -> &str {
        self.key_id
            .split_once('#')
            .map(|(a, _)| a)
            .unwrap_or(&self.key_id)
    }
}

pub fn parse_signature_header(value: &str) -> Result<SignatureParams> {
    // Signature: keyId="...",algorithm="rsa-sha256",headers="(request-target) date",signature="base64..."
    let mut map = HashMap::<String, String>::new();
    for part in value.split(',') {
        let part = part.trim();
        let Some((k, v)) = part.split_once('=') else { continue };
        let v = v.trim().trim_matches('"');
        map.insert(k.trim().to_string(), v.to_string());
    }

    let key_id = map
        .get("keyId")
        .cloned()
        .ok_or_else(|| anyhow!("Signature missing keyId"))?;
    let algorithm = map.get("algorithm").cloned();
    if let Some(alg) = algorithm.as_deref() {
        if !alg.eq_ignore_ascii_case("rsa-sha256") && !alg.eq_ignore_ascii_case("hs2019") {
            return Err(anyhow!("unsupported signature algorithm: {alg}"));
        }
    }
    let headers = map
        .get("headers")
        .cloned()
        .unwrap_or_else(|| "date".to_string());
    let signature_b64 = map
        .get("signature")
        .cloned()
        .ok_or_else(|| anyhow!("Signature missing signature"))?;

    let signature = B64
        .decode(signature_b64.as_bytes())
        .context("decode signature")?;

    Ok(SignatureParams {
        key_id,
        algorithm,
        headers: headers
            .split_whitespace()
            .map(|s| s.to_ascii_lowercase())
            .collect(),
        signature,
    })
}

pub fn build_signing_string(method: &Method, uri: &Uri, headers: &HeaderMap, signed_headers: &[String]) -> Result<String> {
    let mut out = String::new();
    for (i, name) in signed_headers.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        if name == "(request-target)" {
            let path = uri.path();
            let query = uri.query().map(|q| format!("?{q}")).unwrap_or_default();
            out.push_str("(request-target): ");
            out.push_str(&method.as_str().to_ascii_lowercase());
            out.push(' ');
            out.push_str(path);
            out.push_str(&query);
            continue;
        }

        let header_name = http::header::HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("bad signed header name: {name}"))?;
        let value = headers
            .get(&header_name)
            .ok_or_else(|| anyhow!("missing signed header: {name}"))?
            .to_str()
            .with_context(|| format!("invalid header value for {name}"))?;
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value.trim());
    }
    Ok(out)
}

pub fn verify_digest_if_present(headers: &HeaderMap, body: &[u8]) -> Result<()> {
    let Some(digest) = headers.get("Digest") else {
        return Ok(());
    };
    let digest = digest.to_str().context("Digest header not utf8")?;
    // Digest: SHA-256=base64
    let Some((alg, value)) = digest.split_once('=') else {
        return Err(anyhow!("invalid Digest header"));
    };
    if alg.trim().eq_ignore_ascii_case("SHA-256") {
        let expected = B64.decode(value.trim().as_bytes()).context("decode digest")?;
        let actual = Sha256::digest(body);
        if expected.as_slice() != actual.as_slice() {
            return Err(anyhow!("digest mismatch"));
        }
        return Ok(());
    }
    Err(anyhow!("unsupported digest alg: {alg}"))
}

pub fn verify_date(headers: &HeaderMap, max_skew: Duration) -> Result<()> {
    let date = headers
        .get("Date")
        .ok_or_else(|| anyhow!("missing Date header"))?
        .to_str()
        .context("Date header not utf8")?;
    let ts = parse_http_date(date).context("parse Date header")?;
    let now = std::time::SystemTime::now();
    let diff = if now > ts {
        now.duration_since(ts).unwrap_or_default()
    } else {
        ts.duration_since(now).unwrap_or_default()
    };
    if diff > max_skew {
        return Err(anyhow!("Date skew too large: {}s", diff.as_secs()));
    }
    Ok(())
}

pub fn verify_signature_rsa_sha256(public_key_pem: &str, signing_string: &str, signature: &[u8]) -> Result<()> {
    verify_bytes_rsa_sha256(public_key_pem, signing_string.as_bytes(), signature)
}

pub fn verify_bytes_rsa_sha256(public_key_pem: &str, bytes: &[u8], signature: &[u8]) -> Result<()> {
    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .context("parse public key pem")?;
    let verifying_key = VerifyingKey::<Sha256>::new(public_key);
    let sig = rsa::pkcs1v15::Signature::try_from(signature)
        .context("invalid rsa signature bytes")?;
    verifying_key
        .verify(bytes, &sig)
        .context("signature verify failed")?;
    Ok(())
}

/// Checks a parsed signature against an already resolved key.
pub fn verify_request(
    params: &SignatureParams,
    public_key_pem: &str,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
    max_skew: Duration,
) -> Result<()> {
    verify_date(headers, max_skew)?;
    verify_digest_if_present(headers, body)?;
    if !params.headers.iter().any(|h| h == "(request-target)") {
        return Err(anyhow!("signature does not cover (request-target)"));
    }
    let signing_string = build_signing_string(method, uri, headers, &params.headers)?;
    verify_signature_rsa_sha256(public_key_pem, &signing_string, &params.signature)
}

pub fn sign_request_rsa_sha256(
    private_key_pem: &str,
    key_id: &str,
    method: &Method,
    uri: &Uri,
    headers: &mut HeaderMap,
    body: &[u8],
    signed_headers: &[&str],
) -> Result<()> {
    if !headers.contains_key("Date") {
        let date = httpdate::fmt_http_date(std::time::SystemTime::now());
        headers.insert("Date", date.parse().context("set Date")?);
    }

    let mut signed_headers_lower: Vec<String> = signed_headers.iter().map(|s| s.to_ascii_lowercase()).collect();
    if !body.is_empty() && !headers.contains_key("Digest") {
        let digest_b64 = B64.encode(Sha256::digest(body));
        headers.insert(
            "Digest",
            format!("SHA-256={digest_b64}")
                .parse()
                .context("set Digest")?,
        );
    }
    if headers.contains_key("Digest") && !signed_headers_lower.iter().any(|h| h == "digest") {
        signed_headers_lower.push("digest".to_string());
    }

    if !headers.contains_key("Host") {
        if let Some(auth) = uri.authority() {
            headers.insert("Host", auth.as_str().parse().context("set Host")?);
        }
    }

    let signing_string = build_signing_string(method, uri, headers, &signed_headers_lower)?;
    let sig_b64 = B64.encode(sign_bytes_rsa_sha256(private_key_pem, signing_string.as_bytes())?);

    let headers_list = signed_headers_lower.join(" ");
    let sig_header = format!(
        "keyId=\"{key_id}\",algorithm=\"rsa-sha256\",headers=\"{headers_list}\",signature=\"{sig_b64}\""
    );
    headers.insert("Signature", sig_header.parse().context("set Signature")?);
    Ok(())
}

pub fn sign_bytes_rsa_sha256(private_key_pem: &str, bytes: &[u8]) -> Result<Vec<u8>> {
    let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
        .context("parse private key pem")?;
    let signing_key = SigningKey::<Sha256>::new(private_key);
    let mut rng = rand::rngs::OsRng;
    let signature = signing_key.sign_with_rng(&mut rng, bytes);
    Ok(signature.to_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_key_pair;

    #[test]
    fn signed_delivery_headers_verify() {
        let (private_pem, public_pem) = generate_key_pair(1024).unwrap();
        let uri: Uri = "https://b.example/users/bob/inbox".parse().unwrap();
        let body = br#"{"type":"Follow"}"#;
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", "Bearer t".parse().unwrap());
        headers.insert("Content-Type", "application/activity+json".parse().unwrap());
        sign_request_rsa_sha256(
            &private_pem,
            "https://a.example/users/alice#key",
            &Method::POST,
            &uri,
            &mut headers,
            body,
            DELIVERY_SIGNED_HEADERS,
        )
        .unwrap();

        let sig = headers.get("Signature").unwrap().to_str().unwrap();
        let params = parse_signature_header(sig).unwrap();
        assert_eq!(params.actor_id(), "https://a.example/users/alice");
        assert_eq!(
            params.headers,
            vec!["(request-target)", "date", "authorization", "content-type", "digest"]
        );
        verify_request(&params, &public_pem, &Method::POST, &uri, &headers, body, Duration::from_secs(60))
            .unwrap();

        // Tampered body fails the digest check.
        assert!(verify_request(
            &params,
            &public_pem,
            &Method::POST,
            &uri,
            &headers,
            b"{}",
            Duration::from_secs(60)
        )
        .is_err());
    }

    #[test]
    fn stale_date_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert("Date", "Mon, 01 Jan 2001 00:00:00 GMT".parse().unwrap());
        assert!(verify_date(&headers, Duration::from_secs(3600)).is_err());
    }
}
