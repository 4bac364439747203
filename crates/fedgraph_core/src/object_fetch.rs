/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::converter::ConverterRegistry;
use crate::http_retry::send_with_retry;
use crate::http_sig::{sign_request_rsa_sha256, FETCH_SIGNED_HEADERS};
use crate::keys::ActorKey;
use crate::object::ASObject;
use anyhow::{anyhow, Result};
use fedgraph_protocol::ACCEPT_ACTIVITY;
use http::{HeaderMap, Method, Uri};
use tracing::debug;

#[derive(Clone)]
pub struct SignedFetchConfig {
    pub private_key_pem: String,
    pub key_id: String,
}

impl From<&ActorKey> for SignedFetchConfig {
    fn from(k: &ActorKey) -> Self {
        Self {
            private_key_pem: k.private_key_pem.clone(),
            key_id: k.key_id.clone(),
        }
    }
}

/// GETs remote documents and parses them with the converter matching the
/// response `Content-Type`.
#[derive(Clone)]
pub struct RemoteFetcher {
    http: reqwest::Client,
    converters: ConverterRegistry,
}

impl RemoteFetcher {
    pub fn new(http: reqwest::Client, converters: ConverterRegistry) -> Self {
        Self { http, converters }
    }

    /// `Ok(None)` when the remote answered but had nothing usable.
    pub async fn fetch(&self, url: &str, signed: Option<&SignedFetchConfig>) -> Result<Option<ASObject>> {
        let uri: Uri = url.parse().map_err(|_| anyhow!("invalid url: {url}"))?;
        if !matches!(uri.scheme_str(), Some("http") | Some("https")) || uri.host().is_none() {
            return Err(anyhow!("not an http(s) url: {url}"));
        }

        let mut headers = HeaderMap::new();
        headers.insert("Accept", ACCEPT_ACTIVITY.parse().expect("static header"));
        if let Some(s) = signed {
            sign_request_rsa_sha256(
                &s.private_key_pem,
                &s.key_id,
                &Method::GET,
                &uri,
                &mut headers,
                &[],
                FETCH_SIGNED_HEADERS,
            )?;
        }

        let resp = send_with_retry(|| self.http.get(url).headers(headers.clone()), 2).await?;
        if !resp.status().is_success() {
            debug!(url, status = %resp.status(), "fetch not ok");
            return Ok(None);
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/activity+json")
            .to_string();
        let Some(converter) = self.converters.for_content_type(&content_type) else {
            debug!(url, content_type, "no converter for response");
            return Ok(None);
        };
        let body = resp.bytes().await?;
        match converter.parse(&body) {
            Ok(doc) => Ok(Some(doc)),
            Err(e) => {
                debug!(url, "unparsable response: {e:#}");
                Ok(None)
            }
        }
    }
}
