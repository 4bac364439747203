/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::flattener::flatten;
use crate::keys::KeyStore;
use crate::object::{now_ms, APEntity, ASObject, ASTerm};
use crate::store::{ChangeSet, EntityStore};
use anyhow::{anyhow, Result};

/// Box and collection predicates every local actor gets, with their types.
pub const ACTOR_COLLECTIONS: &[(&str, &str)] = &[
    ("inbox", "OrderedCollection"),
    ("outbox", "OrderedCollection"),
    ("followers", "Collection"),
    ("following", "Collection"),
    ("liked", "Collection"),
    ("blocks", "Collection"),
];

#[derive(Debug, Clone)]
pub struct NewActor {
    pub username: String,
    pub display_name: Option<String>,
    pub actor_type: String,
    pub manually_approves_followers: bool,
}

impl NewActor {
    pub fn person(username: &str) -> Self {
        Self {
            username: username.to_string(),
            display_name: None,
            actor_type: "Person".to_string(),
            manually_approves_followers: false,
        }
    }
}

pub fn actor_id_for(base_uri: &str, username: &str) -> String {
    format!("{}/users/{username}", base_uri.trim_end_matches('/'))
}

/// Stages a new owned actor, its collections and its public key block.
pub async fn provision_actor(
    store: &dyn EntityStore,
    keys: &KeyStore,
    base_uri: &str,
    new_actor: &NewActor,
) -> Result<APEntity> {
    let username = new_actor.username.trim();
    if username.is_empty() || !username.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(anyhow!("invalid username: {:?}", new_actor.username));
    }
    let id = actor_id_for(base_uri, username);
    if store.get_entity(&id, false).await?.is_some() {
        return Err(anyhow!("actor already exists: {id}"));
    }
    let key = keys.get_or_create(&id).await?;

    let mut actor = ASObject::typed(&new_actor.actor_type, Some(id.clone()));
    actor.set("preferredUsername", ASTerm::string(username));
    actor.set(
        "name",
        ASTerm::string(new_actor.display_name.clone().unwrap_or_else(|| username.to_string())),
    );
    actor.set("manuallyApprovesFollowers", ASTerm::bool(new_actor.manually_approves_followers));
    actor.set("published", ASTerm::date_time(now_ms()));
    for (pred, ty) in ACTOR_COLLECTIONS {
        let mut c = ASObject::typed(ty, Some(format!("{id}/{pred}")));
        c.set("attributedTo", ASTerm::reference(id.clone()));
        actor.set(pred, ASTerm::Object(c));
    }
    let mut pk = ASObject::with_id(key.key_id.clone());
    pk.set("owner", ASTerm::reference(id.clone()));
    pk.set("publicKeyPem", ASTerm::string(key.public_key_pem.clone()));
    actor.set("publicKey", ASTerm::Object(pk));

    let entities = flatten(&actor)?.into_entities(true)?;
    store
        .apply(ChangeSet {
            entities,
            ..ChangeSet::default()
        })
        .await?;
    store
        .get_entity(&id, false)
        .await?
        .ok_or_else(|| anyhow!("actor vanished while provisioning: {id}"))
}
