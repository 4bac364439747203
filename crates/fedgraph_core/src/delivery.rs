/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Delivery fan-out and the `deliver` job action.

use crate::collections::CollectionTools;
use crate::error::JobError;
use crate::flattener::unflatten;
use crate::http_retry::{classify_status, classify_transport, send_with_retry};
use crate::http_sig::{sign_request_rsa_sha256, DELIVERY_SIGNED_HEADERS};
use crate::object::APEntity;
use crate::pipeline::{self, Principal};
use crate::runtime::Node;
use crate::store::{ChangeSet, EntityStore, NewJob, StagingStore};
use crate::token::issue_token;
use anyhow::Result;
use fedgraph_protocol::{DeliveryPayload, ACTION_DELIVER, AS_PUBLIC, MEDIA_ACTIVITY_JSON};
use http::{HeaderMap, Method, Uri};
use tracing::{debug, info};

const ADDRESSING: &[&str] = &["to", "cc", "bto", "bcc", "audience"];

/// Stages one `deliver` job per distinct target inbox of `entity`.
///
/// Addressees are expanded through owned collections (followers and the
/// like). The public collection, the sender and `exclude_actor` never get a
/// copy. Returns how many jobs were staged.
pub async fn queue_delivery_for_entity(
    node: &Node,
    store: &dyn EntityStore,
    entity: &APEntity,
    outbox: Option<&str>,
    exclude_actor: Option<&str>,
) -> Result<usize> {
    let Some(sender) = entity
        .data
        .first_id("actor")
        .or_else(|| entity.data.first_id("attributedTo"))
        .map(str::to_string)
    else {
        debug!(id = %entity.id, "nothing to deliver: no sender");
        return Ok(0);
    };

    let mut targets = Vec::new();
    for pred in ADDRESSING {
        targets.extend(entity.data.ids(pred));
    }
    let mut skip = vec![sender.as_str()];
    skip.extend(exclude_actor);
    let inboxes = resolve_inboxes(node, store, targets, &skip).await?;
    queue_delivery_to(store, &entity.id, &sender, outbox, inboxes).await
}

/// Stages `deliver` jobs for already resolved inboxes.
pub async fn queue_delivery_to(
    store: &dyn EntityStore,
    object_id: &str,
    sender: &str,
    outbox: Option<&str>,
    inboxes: Vec<String>,
) -> Result<usize> {
    let mut jobs = Vec::with_capacity(inboxes.len());
    for inbox in inboxes {
        let payload = DeliveryPayload {
            object_id: object_id.to_string(),
            target_inbox: inbox,
            sender: sender.to_string(),
            outbox: outbox.map(str::to_string),
        };
        jobs.push(NewJob {
            action: ACTION_DELIVER.to_string(),
            payload: serde_json::to_string(&payload)?,
            delay_ms: 0,
        });
    }
    let n = jobs.len();
    if n > 0 {
        store
            .apply(ChangeSet {
                jobs,
                ..ChangeSet::default()
            })
            .await?;
        debug!(object = object_id, targets = n, "delivery queued");
    }
    Ok(n)
}

/// Turns addressees into inbox URLs. Owned collections are expanded to their
/// members; remote actors are fetched when not cached and their shared inbox
/// is preferred.
pub async fn resolve_inboxes(
    node: &Node,
    store: &dyn EntityStore,
    targets: Vec<String>,
    skip: &[&str],
) -> Result<Vec<String>> {
    let tools = CollectionTools::new(store);
    let mut actors: Vec<String> = Vec::new();
    for target in targets {
        if target == AS_PUBLIC {
            continue;
        }
        match store.get_entity(&target, false).await? {
            Some(e) if e.is_owner && e.is_collection() => {
                actors.extend(tools.elements(&target, true).await?);
            }
            _ => actors.push(target),
        }
    }

    let mut inboxes: Vec<String> = Vec::new();
    let mut seen_actors = std::collections::HashSet::new();
    for actor_id in actors {
        if skip.contains(&actor_id.as_str()) || !seen_actors.insert(actor_id.clone()) {
            continue;
        }
        let Some(actor) = store.get_entity(&actor_id, true).await? else {
            debug!(actor = %actor_id, "addressee not resolvable; skipped");
            continue;
        };
        if !actor.is_actor() {
            continue;
        }
        let inbox = if node.is_local(&actor.id) {
            actor.data.first_id("inbox").map(str::to_string)
        } else {
            match shared_inbox(store, &actor).await? {
                Some(s) => Some(s),
                None => actor.data.first_id("inbox").map(str::to_string),
            }
        };
        if let Some(inbox) = inbox {
            if !inboxes.contains(&inbox) {
                inboxes.push(inbox);
            }
        }
    }
    Ok(inboxes)
}

async fn shared_inbox(store: &dyn EntityStore, actor: &APEntity) -> Result<Option<String>> {
    let Some(endpoints) = actor.data.first_id("endpoints") else {
        return Ok(None);
    };
    Ok(store
        .get_entity(endpoints, false)
        .await?
        .and_then(|e| e.data.first_id("sharedInbox").map(str::to_string)))
}

/// The `deliver` action: loopback into a local inbox, or sign and POST.
pub async fn deliver(node: &Node, store: &StagingStore, payload: &DeliveryPayload) -> Result<(), JobError> {
    if let Some(outbox) = &payload.outbox {
        if !store.collection_contains(outbox, &payload.object_id).await? {
            info!(object = %payload.object_id, "no longer in outbox; delivery skipped");
            return Ok(());
        }
    }
    let Some(entity) = store.get_entity(&payload.object_id, false).await? else {
        return Err(JobError::Permanent(format!("object vanished: {}", payload.object_id)));
    };

    if node.is_local(&payload.target_inbox) {
        // Stored activities already passed provenance checks; forwarded ones keep their author.
        let principal = match entity.data.first_id("actor") {
            Some(actor) if actor != payload.sender => Principal::synthetic(actor),
            _ => Principal::new(&payload.sender),
        };
        let env = pipeline::Env { node, store };
        pipeline::deliver_local(&env, &payload.target_inbox, &payload.object_id, principal).await?;
        debug!(object = %payload.object_id, inbox = %payload.target_inbox, "delivered locally");
        return Ok(());
    }

    let uri: Uri = payload
        .target_inbox
        .parse()
        .map_err(|_| JobError::Permanent(format!("invalid inbox url: {}", payload.target_inbox)))?;
    if !matches!(uri.scheme_str(), Some("http") | Some("https")) || uri.host().is_none() {
        return Err(JobError::Permanent(format!("invalid inbox url: {}", payload.target_inbox)));
    }

    let depth = node.config().effective_depth(None);
    let Some(doc) = unflatten(store, &payload.object_id, depth, false).await? else {
        return Err(JobError::Permanent(format!("object vanished: {}", payload.object_id)));
    };
    let converter = node
        .converters()
        .for_content_type(MEDIA_ACTIVITY_JSON)
        .ok_or_else(|| JobError::Permanent("no activity+json converter".to_string()))?;
    let body = converter
        .render(&doc)
        .map_err(|e| JobError::Permanent(format!("render: {e:#}")))?;

    let key = node
        .keys()
        .get(&payload.sender)
        .await?
        .ok_or_else(|| JobError::Permanent(format!("no signing key for {}", payload.sender)))?;
    let token = issue_token(&key, &payload.target_inbox, node.config().token_ttl_secs)
        .map_err(|e| JobError::Permanent(format!("token: {e:#}")))?;

    let mut headers = HeaderMap::new();
    headers.insert(
        "Authorization",
        format!("Bearer {token}")
            .parse()
            .map_err(|_| JobError::Permanent("token is not a header value".to_string()))?,
    );
    headers.insert("Content-Type", MEDIA_ACTIVITY_JSON.parse().expect("static header"));
    headers.insert("Accept", MEDIA_ACTIVITY_JSON.parse().expect("static header"));
    sign_request_rsa_sha256(
        &key.private_key_pem,
        &key.key_id,
        &Method::POST,
        &uri,
        &mut headers,
        &body,
        DELIVERY_SIGNED_HEADERS,
    )
    .map_err(|e| JobError::Permanent(format!("sign: {e:#}")))?;

    let resp = send_with_retry(
        || {
            node.http()
                .post(&payload.target_inbox)
                .headers(headers.clone())
                .body(body.clone())
        },
        2,
    )
    .await
    .map_err(|e| classify_transport(&e))?;
    let status = resp.status();
    classify_status(status)?;
    info!(object = %payload.object_id, inbox = %payload.target_inbox, %status, "delivered");
    Ok(())
}
