/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};

/// Special audience IRI meaning "everyone".
pub const AS_PUBLIC: &str = "https://www.w3.org/ns/activitystreams#Public";

pub const AS_NAMESPACE: &str = "https://www.w3.org/ns/activitystreams#";
pub const AS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";
pub const SECURITY_CONTEXT: &str = "https://w3id.org/security/v1";

pub const MEDIA_ACTIVITY_JSON: &str = "application/activity+json";
pub const MEDIA_LD_JSON_AS: &str =
    "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";
pub const ACCEPT_ACTIVITY: &str = "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// Wake channel for "a background job was added or rescheduled".
pub const CHANNEL_BACKGROUND_JOB: &str = "new_background_job";
/// Wake channel for "a collection's membership changed" (payload: collection id).
pub const CHANNEL_COLLECTION_CHANGED: &str = "collection_changed";

pub const ACTION_DELIVER: &str = "deliver";
pub const ACTION_FETCH_ENTITY: &str = "fetch_entity";

/// Payload of a `deliver` job: one activity for one target inbox.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DeliveryPayload {
    pub object_id: String,
    pub target_inbox: String,
    pub sender: String,
    /// Outbox the activity was published through; delivery is skipped once it leaves it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbox: Option<String>,
}

/// Payload of a `fetch_entity` job: refresh a cached remote entity.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct FetchPayload {
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub as_actor: Option<String>,
}
