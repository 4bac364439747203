/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod actor;
pub mod collections;
pub mod config;
pub mod context;
pub mod converter;
pub mod delivery;
pub mod error;
pub mod flattener;
pub mod http_retry;
pub mod http_sig;
pub mod job_queue;
pub mod keys;
pub mod notify;
pub mod object;
pub mod object_fetch;
pub mod pipeline;
pub mod runtime;
pub mod store;
pub mod token;
pub mod triple_store;

pub use error::{JobError, PipelineError, PipelineResult};
pub use runtime::Node;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
