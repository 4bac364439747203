/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Client-to-server handlers, in execution order.

use super::{
    actor_collection, author_of, load, resolve_object, store_tree, Env, Flow, Handler, HandlerContext,
    Ownership,
};
use crate::collections::CollectionTools;
use crate::delivery::queue_delivery_for_entity;
use crate::error::{PipelineError, PipelineResult};
use crate::object::{is_activity_type, now_ms, APEntity, ASObject, ASTerm, TOMBSTONE};
use crate::store::EntityStore;
use async_trait::async_trait;
use tracing::debug;

const ADDRESSING: &[&str] = &["to", "cc", "bto", "bcc", "audience"];

/// Activities that make no sense without an `object`.
const NEEDS_OBJECT: &[&str] = &[
    "Create", "Update", "Delete", "Follow", "Accept", "Reject", "Add", "Remove", "Like",
    "Announce", "Undo", "Block",
];

/// Fields an Update may only repeat, never change.
pub const UPDATE_BLACKLIST: &[&str] = &[
    "attributedTo", "actor", "published", "inbox", "outbox", "followers", "following",
    "liked", "likes", "shares", "blocks", "publicKey",
];

pub fn handlers() -> Vec<Box<dyn Handler>> {
    vec![
        Box::new(ObjectWrapper),
        Box::new(ActivityNormalizer),
        Box::new(CreateHandler),
        Box::new(SocialHandler),
        Box::new(AddRemoveHandler),
        Box::new(UpdateDeleteHandler),
        Box::new(FollowResponseHandler),
        Box::new(OutboxDelivery),
    ]
}

/// A bare object posted to an outbox is wrapped in a Create.
pub struct ObjectWrapper;

#[async_trait]
impl Handler for ObjectWrapper {
    fn name(&self) -> &'static str {
        "object_wrapper"
    }

    async fn handle(&self, env: &Env<'_>, mut ctx: HandlerContext) -> PipelineResult<Flow> {
        if ctx.main_object.types.iter().any(|t| is_activity_type(t)) {
            return Ok(Flow::Continue(ctx));
        }
        let mut object = std::mem::take(&mut ctx.main_object);
        if !object.contains("attributedTo") {
            object.set("attributedTo", ASTerm::reference(ctx.actor.clone()));
        }

        let mut create = ASObject::typed("Create", Some(env.node.mint_id(&ctx.actor, "activities")));
        create.set("actor", ASTerm::reference(ctx.actor.clone()));
        for pred in ADDRESSING {
            for t in object.get(pred) {
                create.add(pred, t.clone());
            }
        }
        create.set("object", ASTerm::Object(object));
        ctx.main_object = create;
        Ok(Flow::Continue(ctx))
    }
}

/// Checks who is posting and fills in ids, actor and timestamps.
pub struct ActivityNormalizer;

#[async_trait]
impl Handler for ActivityNormalizer {
    fn name(&self) -> &'static str {
        "activity_normalizer"
    }

    async fn handle(&self, env: &Env<'_>, mut ctx: HandlerContext) -> PipelineResult<Flow> {
        match &ctx.principal {
            Some(p) if p.actor_id == ctx.actor => {}
            Some(p) => {
                return Err(PipelineError::forbidden(format!(
                    "{} may not post to {}",
                    p.actor_id, ctx.target_box
                )))
            }
            None => return Err(PipelineError::forbidden("unauthenticated outbox post")),
        }

        let now = now_ms();
        let keep_id = match ctx.main_object.id.as_deref() {
            Some(id) if env.node.is_local(id) => load(env, id, false).await?.is_none(),
            _ => false,
        };
        if !keep_id {
            ctx.main_object.id = Some(env.node.mint_id(&ctx.actor, "activities"));
        }
        match ctx.main_object.first_id("actor") {
            Some(a) if a != ctx.actor => {
                return Err(PipelineError::validation(format!("actor mismatch: {a}")));
            }
            Some(_) => {}
            None => ctx.main_object.set("actor", ASTerm::reference(ctx.actor.clone())),
        }
        if !ctx.main_object.contains("published") {
            ctx.main_object.set("published", ASTerm::date_time(now));
        }

        let ty = ctx.activity_type().to_string();
        if NEEDS_OBJECT.contains(&ty.as_str()) && !ctx.main_object.contains("object") {
            return Err(PipelineError::validation(format!("{ty} without object")));
        }

        if ty == "Create" {
            let addressing: Vec<(&str, Vec<ASTerm>)> = ADDRESSING
                .iter()
                .map(|p| (*p, ctx.main_object.get(p).to_vec()))
                .collect();
            let actor = ctx.actor.clone();
            let minted = env.node.mint_id(&actor, "objects");
            let Some(ASTerm::Object(object)) = ctx.main_object.get_mut("object").first_mut() else {
                return Err(PipelineError::validation("Create must embed its object"));
            };
            match object.id.as_deref() {
                Some(id) if env.node.is_local(id) => {}
                _ => object.id = Some(minted),
            }
            match object.first_id("attributedTo") {
                Some(a) if a != actor => {
                    return Err(PipelineError::validation(format!("attributedTo mismatch: {a}")));
                }
                Some(_) => {}
                None => object.set("attributedTo", ASTerm::reference(actor)),
            }
            if !object.contains("published") {
                object.set("published", ASTerm::date_time(now));
            }
            if ADDRESSING.iter().all(|p| !object.contains(p)) {
                for (pred, terms) in addressing {
                    for t in terms {
                        object.add(pred, t);
                    }
                }
            }
        }
        Ok(Flow::Continue(ctx))
    }
}

/// Stores a newly created object as owned, with its likes/shares collections.
pub struct CreateHandler;

#[async_trait]
impl Handler for CreateHandler {
    fn name(&self) -> &'static str {
        "create"
    }

    async fn handle(&self, env: &Env<'_>, mut ctx: HandlerContext) -> PipelineResult<Flow> {
        if ctx.activity_type() != "Create" {
            return Ok(Flow::Continue(ctx));
        }
        let Some(ASTerm::Object(mut object)) = ctx.main_object.first("object").cloned() else {
            return Err(PipelineError::validation("Create must embed its object"));
        };
        let id = object
            .id
            .clone()
            .ok_or_else(|| PipelineError::validation("object has no id"))?;
        if load(env, &id, false).await?.is_some() {
            return Err(PipelineError::validation(format!("object id already in use: {id}")));
        }
        for (pred, ty) in [("likes", "OrderedCollection"), ("shares", "OrderedCollection")] {
            if !object.contains(pred) {
                let mut c = ASObject::typed(ty, Some(format!("{id}/{pred}")));
                c.set("attributedTo", ASTerm::reference(ctx.actor.clone()));
                object.set(pred, ASTerm::Object(c));
            }
        }
        store_tree(env, &object, Ownership::Owned(&ctx.actor)).await?;
        ctx.rebind_object(&id);
        Ok(Flow::Continue(ctx))
    }
}

/// Follow, Like, Block and Undo side effects on the actor's own collections.
pub struct SocialHandler;

#[async_trait]
impl Handler for SocialHandler {
    fn name(&self) -> &'static str {
        "social"
    }

    async fn handle(&self, env: &Env<'_>, mut ctx: HandlerContext) -> PipelineResult<Flow> {
        let tools = CollectionTools::new(env.store);
        let ty = ctx.activity_type().to_string();
        match ty.as_str() {
            "Follow" => {
                let target = ctx.object_id()?;
                if load(env, &target, true).await?.is_none() {
                    return Err(PipelineError::not_found(target));
                }
                if ADDRESSING.iter().all(|p| !ctx.main_object.contains(p)) {
                    ctx.main_object.set("to", ASTerm::reference(target.clone()));
                }
                ctx.rebind_object(&target);
            }
            "Like" => {
                let target = ctx.object_id()?;
                if load(env, &target, true).await?.is_none() {
                    return Err(PipelineError::not_found(target));
                }
                let liked = actor_collection(env, &ctx.actor, "liked").await?;
                tools.add(&liked, &target).await?;
                ctx.rebind_object(&target);
            }
            "Block" => {
                let target = ctx.object_id()?;
                let blocks = actor_collection(env, &ctx.actor, "blocks").await?;
                tools.add(&blocks, &target).await?;
                ctx.rebind_object(&target);
                ctx.deliver = false;
            }
            "Undo" => {
                let inner = resolve_object(env, &ctx.main_object, false)
                    .await?
                    .ok_or_else(|| PipelineError::not_found("undone activity"))?;
                let inner_id = inner
                    .id
                    .clone()
                    .ok_or_else(|| PipelineError::validation("undone activity has no id"))?;
                if inner.first_id("actor") != Some(ctx.actor.as_str()) {
                    return Err(PipelineError::validation("Undo requires the original actor"));
                }
                let target = inner.first_id("object").map(str::to_string);
                match (inner.type_name(), target) {
                    (Some("Like"), Some(t)) => {
                        let liked = actor_collection(env, &ctx.actor, "liked").await?;
                        tools.remove(&liked, &t).await?;
                    }
                    (Some("Follow"), Some(t)) => {
                        let following = actor_collection(env, &ctx.actor, "following").await?;
                        tools.remove(&following, &t).await?;
                    }
                    (Some("Block"), Some(t)) => {
                        let blocks = actor_collection(env, &ctx.actor, "blocks").await?;
                        tools.remove(&blocks, &t).await?;
                        ctx.deliver = false;
                    }
                    _ => {}
                }
                ctx.rebind_object(&inner_id);
            }
            _ => {}
        }
        Ok(Flow::Continue(ctx))
    }
}

/// Add/Remove on a collection the actor owns.
pub struct AddRemoveHandler;

#[async_trait]
impl Handler for AddRemoveHandler {
    fn name(&self) -> &'static str {
        "add_remove"
    }

    async fn handle(&self, env: &Env<'_>, mut ctx: HandlerContext) -> PipelineResult<Flow> {
        let ty = ctx.activity_type().to_string();
        if ty != "Add" && ty != "Remove" {
            return Ok(Flow::Continue(ctx));
        }
        let element = ctx.object_id()?;
        let target = ctx
            .main_object
            .first_id("target")
            .map(str::to_string)
            .ok_or_else(|| PipelineError::validation(format!("{ty} without target")))?;
        let collection = load(env, &target, false)
            .await?
            .ok_or_else(|| PipelineError::not_found(target.clone()))?;
        let owned_by_actor = collection.is_owner
            && collection.is_collection()
            && collection.data.first_id("attributedTo") == Some(ctx.actor.as_str());
        if !owned_by_actor {
            return Err(PipelineError::forbidden(format!("{} may not modify {target}", ctx.actor)));
        }
        let tools = CollectionTools::new(env.store);
        if ty == "Add" {
            tools.add(&target, &element).await?;
        } else {
            tools.remove(&target, &element).await?;
        }
        ctx.rebind_object(&element);
        ctx.main_object.set("target", ASTerm::reference(target));
        Ok(Flow::Continue(ctx))
    }
}

/// Full-replace Update and tombstoning Delete of the actor's own objects.
pub struct UpdateDeleteHandler;

#[async_trait]
impl Handler for UpdateDeleteHandler {
    fn name(&self) -> &'static str {
        "update_delete"
    }

    async fn handle(&self, env: &Env<'_>, mut ctx: HandlerContext) -> PipelineResult<Flow> {
        let ty = ctx.activity_type().to_string();
        if ty != "Update" && ty != "Delete" {
            return Ok(Flow::Continue(ctx));
        }
        let id = ctx.object_id()?;
        let existing = load(env, &id, false)
            .await?
            .ok_or_else(|| PipelineError::not_found(id.clone()))?;
        if !existing.is_owner {
            return Err(PipelineError::forbidden(format!("{id} is not owned here")));
        }
        if existing.is_tombstone() {
            return Err(PipelineError::validation(format!("{id} was deleted")));
        }
        if author_of(&existing.data).as_deref() != Some(ctx.actor.as_str()) {
            return Err(PipelineError::validation(format!("{} is not the author of {id}", ctx.actor)));
        }

        if ty == "Update" {
            let Some(ASTerm::Object(update)) = ctx.main_object.first("object").cloned() else {
                return Err(PipelineError::validation("Update must embed the full object"));
            };
            let replaced = merge_update(&existing, update)?;
            store_tree(env, &replaced, Ownership::Owned(&ctx.actor)).await?;
        } else {
            let tomb = tombstone(&existing);
            env.store.store_entity(APEntity::new(tomb, true)?).await?;
        }
        ctx.rebind_object(&id);
        Ok(Flow::Continue(ctx))
    }
}

/// Builds the replacement for a full-object Update. Blacklisted fields must be
/// value-identical when present and are carried over when absent.
pub fn merge_update(existing: &APEntity, mut update: ASObject) -> PipelineResult<ASObject> {
    match update.id.as_deref() {
        Some(id) if id != existing.id => {
            return Err(PipelineError::validation("Update may not change id"));
        }
        _ => update.id = Some(existing.id.clone()),
    }
    if update.types.is_empty() {
        update.types = existing.data.types.clone();
    } else if update.types != existing.data.types {
        return Err(PipelineError::validation("Update may not change type"));
    }
    for field in UPDATE_BLACKLIST {
        let old = existing.data.get(field);
        if update.contains(field) {
            if !same_terms(old, update.get(field)) {
                return Err(PipelineError::validation(format!("Update may not change {field}")));
            }
            // Keep the stored form so embedded copies do not overwrite owned nodes.
            *update.get_mut(field) = old.to_vec();
        } else if !old.is_empty() {
            *update.get_mut(field) = old.to_vec();
        }
    }
    update.set("updated", ASTerm::date_time(now_ms()));
    Ok(update)
}

/// Terms compare by node id when they have one, by value otherwise.
fn same_terms(a: &[ASTerm], b: &[ASTerm]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| match (x.id(), y.id()) {
            (Some(i), Some(j)) => i == j,
            (None, None) => x == y,
            _ => false,
        })
}

/// Tombstone keeping only id, type, formerType and timestamps.
pub fn tombstone(existing: &APEntity) -> ASObject {
    let mut tomb = ASObject::typed(TOMBSTONE, Some(existing.id.clone()));
    tomb.set("formerType", ASTerm::string(existing.type_name.clone()));
    for field in ["published", "updated"] {
        if let Some(t) = existing.data.first(field) {
            tomb.set(field, t.clone());
        }
    }
    tomb.set("deleted", ASTerm::date_time(now_ms()));
    tomb
}

/// Accept/Reject of a Follow aimed at the actor.
pub struct FollowResponseHandler;

#[async_trait]
impl Handler for FollowResponseHandler {
    fn name(&self) -> &'static str {
        "follow_response"
    }

    async fn handle(&self, env: &Env<'_>, mut ctx: HandlerContext) -> PipelineResult<Flow> {
        let ty = ctx.activity_type().to_string();
        if ty != "Accept" && ty != "Reject" {
            return Ok(Flow::Continue(ctx));
        }
        let follow = resolve_object(env, &ctx.main_object, false)
            .await?
            .ok_or_else(|| PipelineError::not_found("responded Follow"))?;
        if !follow.is_type("Follow") || follow.first_id("object") != Some(ctx.actor.as_str()) {
            return Err(PipelineError::validation(format!("{ty} must answer a Follow of {}", ctx.actor)));
        }
        let follower = follow
            .first_id("actor")
            .map(str::to_string)
            .ok_or_else(|| PipelineError::validation("Follow without actor"))?;
        let follow_id = follow
            .id
            .clone()
            .ok_or_else(|| PipelineError::validation("Follow without id"))?;

        let followers = actor_collection(env, &ctx.actor, "followers").await?;
        let tools = CollectionTools::new(env.store);
        if ty == "Accept" {
            tools.add(&followers, &follower).await?;
        } else {
            tools.remove(&followers, &follower).await?;
        }
        if ADDRESSING.iter().all(|p| !ctx.main_object.contains(p)) {
            ctx.main_object.set("to", ASTerm::reference(follower));
        }
        ctx.rebind_object(&follow_id);
        Ok(Flow::Continue(ctx))
    }
}

/// Stores the activity, appends it to the outbox and queues delivery.
pub struct OutboxDelivery;

#[async_trait]
impl Handler for OutboxDelivery {
    fn name(&self) -> &'static str {
        "outbox_delivery"
    }

    async fn handle(&self, env: &Env<'_>, mut ctx: HandlerContext) -> PipelineResult<Flow> {
        let id = ctx.activity_id()?;
        // Embedded objects with an id were handled above; only links remain.
        for pred in ["object", "target"] {
            if !ctx.main_object.contains(pred) {
                continue;
            }
            for t in ctx.main_object.get_mut(pred).iter_mut() {
                if let ASTerm::Object(o) = t {
                    if let Some(oid) = o.id.clone() {
                        *t = ASTerm::Ref(oid);
                    }
                }
            }
        }
        store_tree(env, &ctx.main_object, Ownership::Owned(&ctx.actor)).await?;
        CollectionTools::new(env.store).add(&ctx.target_box, &id).await?;

        if ctx.deliver {
            let entity = load(env, &id, false)
                .await?
                .ok_or_else(|| PipelineError::not_found(id.clone()))?;
            let n = queue_delivery_for_entity(env.node, env.store, &entity, Some(&ctx.target_box), None).await?;
            debug!(activity = %id, targets = n, "outbox post queued");
        }
        Ok(Flow::Continue(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(data: ASObject) -> APEntity {
        APEntity::new(data, true).unwrap()
    }

    #[test]
    fn update_keeps_blacklisted_fields_and_type() {
        let mut note = ASObject::typed("Note", Some("https://a.example/n/1".into()));
        note.set("attributedTo", ASTerm::reference("https://a.example/users/alice"));
        note.set("content", ASTerm::string("old"));
        let existing = stored(note);

        let mut update = ASObject::with_id("https://a.example/n/1");
        update.set("content", ASTerm::string("new"));
        let merged = merge_update(&existing, update).unwrap();
        assert_eq!(merged.type_name(), Some("Note"));
        assert_eq!(merged.first_id("attributedTo"), Some("https://a.example/users/alice"));
        assert_eq!(merged.first_str("content"), Some("new"));
        assert!(merged.contains("updated"));
    }

    #[test]
    fn update_rejects_changed_author() {
        let mut note = ASObject::typed("Note", Some("https://a.example/n/1".into()));
        note.set("attributedTo", ASTerm::reference("https://a.example/users/alice"));
        let existing = stored(note);

        let mut update = ASObject::typed("Note", Some("https://a.example/n/1".into()));
        update.set("attributedTo", ASTerm::reference("https://a.example/users/mallory"));
        let err = merge_update(&existing, update).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[test]
    fn tombstone_drops_content() {
        let mut note = ASObject::typed("Note", Some("https://a.example/n/1".into()));
        note.set("content", ASTerm::string("bye"));
        note.set("published", ASTerm::date_time(0));
        let tomb = tombstone(&stored(note));
        assert_eq!(tomb.type_name(), Some(TOMBSTONE));
        assert_eq!(tomb.first_str("formerType"), Some("Note"));
        assert!(tomb.contains("published"));
        assert!(tomb.contains("deleted"));
        assert!(!tomb.contains("content"));
    }
}
