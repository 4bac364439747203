/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Activity pipelines.
//!
//! A pipeline is an ordered list of [`Handler`]s run against one activity
//! inside one staging transaction. Each handler takes the context by value and
//! hands back a (possibly rebound) context. Any error aborts the run; the
//! caller then discards the staged writes.

pub mod c2s;
pub mod s2s;

use crate::error::{PipelineError, PipelineResult};
use crate::flattener::{flatten, is_generated_under, unflatten};
use crate::object::{host_of, APEntity, ASObject, ASTerm};
use crate::runtime::Node;
use crate::store::{ChangeSet, EntityStore, StagingStore};
use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt};
use tracing::debug;

/// Who the request was authenticated as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub actor_id: String,
    /// Minted by the server itself (auto-Accept, local forwarding) rather than
    /// proven by a signature or token.
    pub synthetic: bool,
}

impl Principal {
    pub fn new(actor_id: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            synthetic: false,
        }
    }

    pub fn synthetic(actor_id: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            synthetic: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HandlerContext {
    /// The activity being processed. Handlers may rebind it.
    pub main_object: ASObject,
    /// Posting actor (client-to-server) or inbox owner (server-to-server).
    pub actor: String,
    /// Outbox or inbox the activity was posted to.
    pub target_box: String,
    pub principal: Option<Principal>,
    /// Cleared by handlers whose activity must stay local (Block).
    pub deliver: bool,
}

impl HandlerContext {
    pub fn new(main_object: ASObject, actor: &str, target_box: &str, principal: Option<Principal>) -> Self {
        Self {
            main_object,
            actor: actor.to_string(),
            target_box: target_box.to_string(),
            principal,
            deliver: true,
        }
    }

    pub fn activity_type(&self) -> &str {
        self.main_object.type_name().unwrap_or_default()
    }

    pub fn activity_id(&self) -> PipelineResult<String> {
        self.main_object
            .id
            .clone()
            .ok_or_else(|| PipelineError::validation("activity has no id"))
    }

    pub fn activity_actor(&self) -> PipelineResult<String> {
        self.main_object
            .first_id("actor")
            .map(str::to_string)
            .ok_or_else(|| PipelineError::validation("activity has no actor"))
    }

    pub fn object_id(&self) -> PipelineResult<String> {
        self.main_object
            .first_id("object")
            .map(str::to_string)
            .ok_or_else(|| PipelineError::validation("activity has no object id"))
    }

    /// Replaces the embedded `object` with a bare reference.
    pub fn rebind_object(&mut self, id: &str) {
        self.main_object.set("object", ASTerm::reference(id));
    }
}

/// Result of one handler.
#[derive(Debug)]
pub enum Flow {
    Continue(HandlerContext),
    /// Stop without error; nothing after this handler runs.
    Stop(HandlerContext),
}

/// What every handler can reach: the node and the current transaction.
pub struct Env<'a> {
    pub node: &'a Node,
    pub store: &'a StagingStore,
}

#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, env: &Env<'_>, ctx: HandlerContext) -> PipelineResult<Flow>;
}

pub struct Pipeline {
    handlers: Vec<Box<dyn Handler>>,
}

impl Pipeline {
    pub fn new(handlers: Vec<Box<dyn Handler>>) -> Self {
        Self { handlers }
    }

    pub fn client_to_server() -> Self {
        Self::new(c2s::handlers())
    }

    pub fn server_to_server() -> Self {
        Self::new(s2s::handlers())
    }

    pub fn handler_names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    /// Runs every handler in order. Does not commit.
    pub fn run<'a>(&'a self, env: &'a Env<'a>, ctx: HandlerContext) -> BoxFuture<'a, PipelineResult<HandlerContext>> {
        async move {
            let mut ctx = ctx;
            for h in &self.handlers {
                match h.handle(env, ctx).await {
                    Ok(Flow::Continue(next)) => ctx = next,
                    Ok(Flow::Stop(done)) => {
                        debug!(handler = h.name(), "pipeline stopped");
                        return Ok(done);
                    }
                    Err(e) => {
                        debug!(handler = h.name(), "pipeline aborted: {e}");
                        return Err(e);
                    }
                }
            }
            Ok(ctx)
        }
        .boxed()
    }
}

/// Runs `pipeline` in `store`, then commits, or discards on error.
pub async fn run_and_commit(
    pipeline: &Pipeline,
    env: &Env<'_>,
    ctx: HandlerContext,
) -> PipelineResult<HandlerContext> {
    match pipeline.run(env, ctx).await {
        Ok(done) => {
            env.store.commit_changes().await?;
            Ok(done)
        }
        Err(e) => {
            env.store.discard().await;
            Err(e)
        }
    }
}

/// Loopback delivery: runs the server-to-server pipeline for a stored
/// activity against a local inbox, inside the caller's transaction.
pub async fn deliver_local(
    env: &Env<'_>,
    inbox: &str,
    activity_id: &str,
    principal: Principal,
) -> PipelineResult<HandlerContext> {
    let owner = inbox_owner(env, inbox).await?;
    let depth = env.node.config().effective_depth(None);
    let doc = unflatten(env.store, activity_id, depth, false)
        .await?
        .ok_or_else(|| PipelineError::not_found(activity_id))?;
    let ctx = HandlerContext::new(doc, &owner, inbox, Some(principal));
    Pipeline::server_to_server().run(env, ctx).await
}

/// Owner of a local box: the actor its collection is attributed to.
pub async fn inbox_owner(env: &Env<'_>, box_id: &str) -> PipelineResult<String> {
    let entity = env
        .store
        .get_entity(box_id, false)
        .await?
        .ok_or_else(|| PipelineError::not_found(box_id))?;
    if !entity.is_owner || !entity.is_collection() {
        return Err(PipelineError::validation(format!("not a local box: {box_id}")));
    }
    entity
        .data
        .first_id("attributedTo")
        .map(str::to_string)
        .ok_or_else(|| PipelineError::validation(format!("box without owner: {box_id}")))
}

/// Who is responsible for `obj`: `attributedTo`, the `actor` of an
/// activity, or the object itself when it is an actor.
pub fn author_of(obj: &ASObject) -> Option<String> {
    if let Some(a) = obj.first_id("attributedTo").or_else(|| obj.first_id("actor")) {
        return Some(a.to_string());
    }
    let is_actor = obj
        .types
        .iter()
        .any(|t| crate::object::ACTOR_TYPES.contains(&t.as_str()));
    if is_actor {
        obj.id.clone()
    } else {
        None
    }
}

/// The activity's `object`, embedded or loaded by reference.
pub async fn resolve_object(env: &Env<'_>, activity: &ASObject, allow_remote: bool) -> PipelineResult<Option<ASObject>> {
    match activity.first("object") {
        Some(ASTerm::Object(o)) => Ok(Some(o.clone())),
        Some(ASTerm::Ref(id)) => Ok(env
            .store
            .get_entity(id, allow_remote)
            .await?
            .map(|e| e.data)),
        _ => Ok(None),
    }
}

pub async fn load(env: &Env<'_>, id: &str, allow_remote: bool) -> PipelineResult<Option<APEntity>> {
    Ok(env.store.get_entity(id, allow_remote).await?)
}

/// Loads an actor and returns the id of one of its collections.
pub async fn actor_collection(env: &Env<'_>, actor_id: &str, pred: &str) -> PipelineResult<String> {
    let actor = load(env, actor_id, false)
        .await?
        .ok_or_else(|| PipelineError::not_found(actor_id))?;
    actor
        .data
        .first_id(pred)
        .map(str::to_string)
        .ok_or_else(|| PipelineError::validation(format!("{actor_id} has no {pred}")))
}

/// How [`store_tree`] writes the nodes of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership<'a> {
    /// Local content written on behalf of this actor.
    Owned(&'a str),
    /// Cached copy of a document from the root's origin.
    Cached,
}

/// Flattens `doc` and stages the root plus the nested nodes the document may
/// speak for. Anything else stays a reference in its parent.
///
/// Owned: nested nodes must be blank nodes under the root, new local ids, or
/// owned objects already authored by the same actor (actors excluded).
/// Cached: nested nodes must share the root's host, must not be local, and
/// never replace an owned copy.
pub async fn store_tree(env: &Env<'_>, doc: &ASObject, ownership: Ownership<'_>) -> PipelineResult<()> {
    let flat = flatten(doc)?;
    let origin = host_of(&flat.root);
    let is_owner = matches!(ownership, Ownership::Owned(_));
    let mut changes = ChangeSet::default();
    for node in flat.nodes {
        let entity = APEntity::new(node, is_owner)?;
        let nested = entity.id != flat.root;
        let existing = env.store.get_entity(&entity.id, false).await?;
        let keep = match ownership {
            Ownership::Owned(actor) => {
                !nested
                    || is_generated_under(&entity.id, &flat.root)
                    || match &existing {
                        None => env.node.is_local(&entity.id),
                        Some(e) => {
                            e.is_owner && !e.is_actor() && author_of(&e.data).as_deref() == Some(actor)
                        }
                    }
            }
            Ownership::Cached => {
                !existing.as_ref().is_some_and(|e| e.is_owner)
                    && !env.node.is_local(&entity.id)
                    && (!nested || host_of(&entity.id) == origin)
            }
        };
        if keep {
            changes.put_entity(entity);
        } else {
            debug!(id = %entity.id, root = %flat.root, "node not written by this document");
        }
    }
    env.store.apply(changes).await?;
    Ok(())
}
