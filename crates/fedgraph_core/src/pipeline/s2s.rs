/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Server-to-server (inbox) handlers, in execution order.

use super::{
    actor_collection, author_of, load, resolve_object, store_tree, Env, Flow, Handler, HandlerContext,
    Ownership, Pipeline, Principal,
};
use crate::collections::CollectionTools;
use crate::delivery::{queue_delivery_to, resolve_inboxes};
use crate::error::{PipelineError, PipelineResult};
use crate::object::{host_of, APEntity, ASObject, ASTerm};
use crate::pipeline::c2s::tombstone;
use crate::store::EntityStore;
use async_trait::async_trait;
use tracing::{debug, info};

pub fn handlers() -> Vec<Box<dyn Handler>> {
    vec![
        Box::new(Provenance),
        Box::new(DuplicateGuard),
        Box::new(BlockGuard),
        Box::new(CreateHandler),
        Box::new(FollowHandler),
        Box::new(FollowResponseHandler),
        Box::new(ReactionHandler),
        Box::new(UndoHandler),
        Box::new(UpdateDeleteHandler),
        Box::new(InboxDelivery),
    ]
}

/// The authenticated sender must be the activity's actor, and the activity
/// must come from the actor's own origin. Embedded objects from other origins
/// are reduced to references.
pub struct Provenance;

#[async_trait]
impl Handler for Provenance {
    fn name(&self) -> &'static str {
        "provenance"
    }

    async fn handle(&self, _env: &Env<'_>, mut ctx: HandlerContext) -> PipelineResult<Flow> {
        let principal = ctx
            .principal
            .clone()
            .ok_or_else(|| PipelineError::forbidden("unauthenticated inbox post"))?;
        let actor = ctx.activity_actor()?;
        if principal.actor_id != actor {
            return Err(PipelineError::forbidden(format!(
                "{} may not speak for {actor}",
                principal.actor_id
            )));
        }
        let id = ctx.activity_id()?;
        let origin = host_of(&actor);
        if origin.is_none() || host_of(&id) != origin {
            return Err(PipelineError::validation(format!("{id} is not on the origin of {actor}")));
        }

        for pred in ["object", "target"] {
            if !ctx.main_object.contains(pred) {
                continue;
            }
            for t in ctx.main_object.get_mut(pred).iter_mut() {
                let oid = match &*t {
                    ASTerm::Object(ASObject { id: Some(oid), .. }) => oid.clone(),
                    _ => continue,
                };
                if host_of(&oid) != origin {
                    debug!(activity = %id, object = %oid, "foreign embedded object reduced to a link");
                    *t = ASTerm::Ref(oid);
                }
            }
        }
        Ok(Flow::Continue(ctx))
    }
}

/// An activity already in the inbox is not processed twice.
pub struct DuplicateGuard;

#[async_trait]
impl Handler for DuplicateGuard {
    fn name(&self) -> &'static str {
        "duplicate_guard"
    }

    async fn handle(&self, env: &Env<'_>, ctx: HandlerContext) -> PipelineResult<Flow> {
        let id = ctx.activity_id()?;
        if env.store.collection_contains(&ctx.target_box, &id).await? {
            debug!(activity = %id, "already received");
            return Ok(Flow::Stop(ctx));
        }
        Ok(Flow::Continue(ctx))
    }
}

/// Activities from actors the inbox owner blocked are dropped silently.
pub struct BlockGuard;

#[async_trait]
impl Handler for BlockGuard {
    fn name(&self) -> &'static str {
        "block_guard"
    }

    async fn handle(&self, env: &Env<'_>, ctx: HandlerContext) -> PipelineResult<Flow> {
        let actor = ctx.activity_actor()?;
        let blocks = actor_collection(env, &ctx.actor, "blocks").await?;
        if env.store.collection_contains(&blocks, &actor).await? {
            info!(owner = %ctx.actor, %actor, "dropped activity from blocked actor");
            return Ok(Flow::Stop(ctx));
        }
        Ok(Flow::Continue(ctx))
    }
}

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
        let actor = ctx.activity_actor()?;
        let object = resolve_object(env, &ctx.main_object, true)
            .await?
            .ok_or_else(|| PipelineError::not_found("created object"))?;
        let id = object
            .id
            .clone()
            .ok_or_else(|| PipelineError::validation("created object has no id"))?;
        if author_of(&object).as_deref() != Some(actor.as_str()) {
            return Err(PipelineError::validation(format!("{id} is not attributed to {actor}")));
        }

        if let Some(existing) = load(env, &id, false).await? {
            if existing.is_tombstone() {
                return Err(PipelineError::validation(format!("{id} was deleted")));
            }
            if existing.is_owner {
                let loopback = env.node.is_local(&actor)
                    && author_of(&existing.data).as_deref() == Some(actor.as_str());
                if !loopback {
                    return Err(PipelineError::validation(format!("{id} is owned here")));
                }
                ctx.rebind_object(&id);
                return Ok(Flow::Continue(ctx));
            }
        }
        store_tree(env, &object, Ownership::Cached).await?;
        ctx.rebind_object(&id);
        Ok(Flow::Continue(ctx))
    }
}

/// Records a Follow of the inbox owner and, unless the owner approves
/// followers manually, answers it with an Accept posted through the owner's
/// outbox in the same transaction.
pub struct FollowHandler;

#[async_trait]
impl Handler for FollowHandler {
    fn name(&self) -> &'static str {
        "follow"
    }

    async fn handle(&self, env: &Env<'_>, ctx: HandlerContext) -> PipelineResult<Flow> {
        if ctx.activity_type() != "Follow" || ctx.object_id()? != ctx.actor {
            return Ok(Flow::Continue(ctx));
        }
        let follower = ctx.activity_actor()?;
        let follow_id = ctx.activity_id()?;
        store_tree(env, &ctx.main_object, Ownership::Cached).await?;

        let owner = load(env, &ctx.actor, false)
            .await?
            .ok_or_else(|| PipelineError::not_found(ctx.actor.clone()))?;
        if owner.data.first_bool("manuallyApprovesFollowers") == Some(true) {
            debug!(owner = %ctx.actor, %follower, "follow awaits approval");
            return Ok(Flow::Continue(ctx));
        }

        let outbox = actor_collection(env, &ctx.actor, "outbox").await?;
        let mut accept = ASObject::typed("Accept", Some(env.node.mint_id(&ctx.actor, "activities")));
        accept.set("actor", ASTerm::reference(ctx.actor.clone()));
        accept.set("object", ASTerm::reference(follow_id));
        accept.set("to", ASTerm::reference(follower.clone()));
        let reply = HandlerContext::new(accept, &ctx.actor, &outbox, Some(Principal::synthetic(&ctx.actor)));
        Pipeline::client_to_server().run(env, reply).await?;
        info!(owner = %ctx.actor, %follower, "follow accepted");
        Ok(Flow::Continue(ctx))
    }
}

/// Accept/Reject of a Follow the inbox owner sent.
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
        let actor = ctx.activity_actor()?;
        let Some(follow) = resolve_object(env, &ctx.main_object, false).await? else {
            debug!(%actor, "{ty} of an unknown object ignored");
            return Ok(Flow::Continue(ctx));
        };
        let Some(follow_id) = follow.id.clone() else {
            return Ok(Flow::Continue(ctx));
        };
        if !follow.is_type("Follow") {
            return Ok(Flow::Continue(ctx));
        }
        if follow.first_id("actor") != Some(ctx.actor.as_str()) || follow.first_id("object") != Some(actor.as_str()) {
            return Err(PipelineError::validation(format!("{ty} does not answer a Follow of {actor}")));
        }
        let outbox = actor_collection(env, &ctx.actor, "outbox").await?;
        if !env.store.collection_contains(&outbox, &follow_id).await? {
            debug!(follow = %follow_id, "{ty} of a Follow that was never sent");
            return Ok(Flow::Continue(ctx));
        }

        let following = actor_collection(env, &ctx.actor, "following").await?;
        let tools = CollectionTools::new(env.store);
        if ty == "Accept" {
            tools.add(&following, &actor).await?;
        } else {
            tools.remove(&following, &actor).await?;
        }
        ctx.rebind_object(&follow_id);
        Ok(Flow::Continue(ctx))
    }
}

/// Like and Announce of locally owned objects land in their likes/shares.
pub struct ReactionHandler;

#[async_trait]
impl Handler for ReactionHandler {
    fn name(&self) -> &'static str {
        "reaction"
    }

    async fn handle(&self, env: &Env<'_>, ctx: HandlerContext) -> PipelineResult<Flow> {
        let Some(pred) = reaction_collection(ctx.activity_type()) else {
            return Ok(Flow::Continue(ctx));
        };
        let target = ctx.object_id()?;
        if let Some(coll) = owned_reaction_collection(env, &target, pred).await? {
            CollectionTools::new(env.store).add(&coll, &ctx.activity_id()?).await?;
        }
        Ok(Flow::Continue(ctx))
    }
}

fn reaction_collection(activity_type: &str) -> Option<&'static str> {
    match activity_type {
        "Like" => Some("likes"),
        "Announce" => Some("shares"),
        _ => None,
    }
}

async fn owned_reaction_collection(env: &Env<'_>, target: &str, pred: &str) -> PipelineResult<Option<String>> {
    Ok(load(env, target, false)
        .await?
        .filter(|e| e.is_owner)
        .and_then(|e| e.data.first_id(pred).map(str::to_string)))
}

pub struct UndoHandler;

#[async_trait]
impl Handler for UndoHandler {
    fn name(&self) -> &'static str {
        "undo"
    }

    async fn handle(&self, env: &Env<'_>, ctx: HandlerContext) -> PipelineResult<Flow> {
        if ctx.activity_type() != "Undo" {
            return Ok(Flow::Continue(ctx));
        }
        let actor = ctx.activity_actor()?;
        let Some(inner) = resolve_object(env, &ctx.main_object, false).await? else {
            debug!(%actor, "undo of an unknown activity ignored");
            return Ok(Flow::Continue(ctx));
        };
        if inner.first_id("actor") != Some(actor.as_str()) {
            return Err(PipelineError::validation("Undo requires the original actor"));
        }
        let tools = CollectionTools::new(env.store);
        let inner_type = inner.type_name().unwrap_or_default();
        if inner_type == "Follow" && inner.first_id("object") == Some(ctx.actor.as_str()) {
            let followers = actor_collection(env, &ctx.actor, "followers").await?;
            tools.remove(&followers, &actor).await?;
        } else if let (Some(pred), Some(target), Some(inner_id)) =
            (reaction_collection(inner_type), inner.first_id("object"), inner.id.as_deref())
        {
            if let Some(coll) = owned_reaction_collection(env, target, pred).await? {
                tools.remove(&coll, inner_id).await?;
            }
        }
        Ok(Flow::Continue(ctx))
    }
}

/// Remote Update/Delete of cached objects. Owned objects can only be touched
/// by their local author, which already happened on the way out.
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
        let actor = ctx.activity_actor()?;
        let id = ctx.object_id()?;
        let existing = load(env, &id, false).await?;
        if let Some(e) = &existing {
            let authored = author_of(&e.data).as_deref() == Some(actor.as_str());
            if e.is_owner {
                if env.node.is_local(&actor) && authored {
                    ctx.rebind_object(&id);
                    return Ok(Flow::Continue(ctx));
                }
                return Err(PipelineError::validation(format!("{id} is owned here")));
            }
            if !authored {
                return Err(PipelineError::validation(format!("{actor} is not the author of {id}")));
            }
        }

        if ty == "Update" {
            if let Some(ASTerm::Object(update)) = ctx.main_object.first("object").cloned() {
                if author_of(&update).as_deref() != Some(actor.as_str()) {
                    return Err(PipelineError::validation(format!("{actor} is not the author of {id}")));
                }
                store_tree(env, &update, Ownership::Cached).await?;
            }
        } else if let Some(e) = &existing {
            env.store.store_entity(APEntity::new(tombstone(e), false)?).await?;
        }
        ctx.rebind_object(&id);
        Ok(Flow::Continue(ctx))
    }
}

/// Stores the activity, appends it to the inbox and forwards it to owned
/// collections of the inbox owner that it addresses.
pub struct InboxDelivery;

#[async_trait]
impl Handler for InboxDelivery {
    fn name(&self) -> &'static str {
        "inbox_delivery"
    }

    async fn handle(&self, env: &Env<'_>, ctx: HandlerContext) -> PipelineResult<Flow> {
        let id = ctx.activity_id()?;
        let actor = ctx.activity_actor()?;
        store_tree(env, &ctx.main_object, Ownership::Cached).await?;
        CollectionTools::new(env.store).add(&ctx.target_box, &id).await?;

        if env.node.is_local(&actor) {
            return Ok(Flow::Continue(ctx));
        }
        let mut forward_to = Vec::new();
        for pred in ["to", "cc", "audience"] {
            for target in ctx.main_object.ids(pred) {
                let Some(e) = load(env, &target, false).await? else { continue };
                if e.is_owner && e.is_collection() && e.data.first_id("attributedTo") == Some(ctx.actor.as_str()) {
                    forward_to.push(target);
                }
            }
        }
        if forward_to.is_empty() {
            return Ok(Flow::Continue(ctx));
        }
        let inboxes = resolve_inboxes(env.node, env.store, forward_to, &[actor.as_str(), ctx.actor.as_str()]).await?;
        let n = queue_delivery_to(env.store, &id, &ctx.actor, None, inboxes).await?;
        debug!(activity = %id, targets = n, "inbox forward queued");
        Ok(Flow::Continue(ctx))
    }
}
