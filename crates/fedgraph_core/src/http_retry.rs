/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::error::JobError;
use rand::{thread_rng, Rng};
use reqwest::{RequestBuilder, Response, StatusCode};
use std::time::Duration;

/// Sends with a few quick in-call retries on 429/5xx and transient transport
/// errors. Long-horizon retries belong to the job queue.
pub async fn send_with_retry<F>(mut build: F, attempts: u32) -> Result<Response, reqwest::Error>
where
    F: FnMut() -> RequestBuilder,
{
    let max_attempts = attempts.clamp(1, 5);
    let mut backoff = Duration::from_millis(200);
    for attempt in 0..max_attempts {
        match build().send().await {
            Ok(resp) => {
                if should_retry_status(resp.status()) && attempt + 1 < max_attempts {
                    sleep_with_jitter(backoff).await;
                    backoff = backoff.saturating_mul(2).min(Duration::from_secs(5));
                    continue;
                }
                return Ok(resp);
            }
            Err(e) => {
                if attempt + 1 >= max_attempts || !is_transient(&e) {
                    return Err(e);
                }
                sleep_with_jitter(backoff).await;
                backoff = backoff.saturating_mul(2).min(Duration::from_secs(5));
            }
        }
    }
    unreachable!("retry loop should return or error");
}

pub fn should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn is_transient(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_request()
}

/// Maps a delivery response status to the queue's retry class.
pub fn classify_status(status: StatusCode) -> Result<(), JobError> {
    if status.is_success() {
        return Ok(());
    }
    if should_retry_status(status) {
        return Err(JobError::Retryable(format!("http {status}")));
    }
    Err(JobError::Permanent(format!("http {status}")))
}

pub fn classify_transport(e: &reqwest::Error) -> JobError {
    if e.is_builder() {
        JobError::Permanent(format!("bad request: {e}"))
    } else {
        JobError::Retryable(format!("transport: {e}"))
    }
}

async fn sleep_with_jitter(base: Duration) {
    let jitter_ms: u64 = thread_rng().gen_range(0..=200);
    let jitter = Duration::from_millis(jitter_ms);
    tokio::time::sleep(base + jitter).await;
}
