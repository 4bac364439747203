/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::actor::{self, NewActor};
use crate::collections;
use crate::config::ServerConfig;
use crate::context::JsonLdContext;
use crate::converter::ConverterRegistry;
use crate::delivery;
use crate::error::{JobError, PipelineError, PipelineResult};
use crate::flattener::unflatten;
use crate::http_sig::{parse_signature_header, verify_request};
use crate::job_queue::{Job, JobExecutor, JobQueue};
use crate::keys::KeyStore;
use crate::notify::NotifyHub;
use crate::object::{host_of, APEntity, ASObject};
use crate::object_fetch::{RemoteFetcher, SignedFetchConfig};
use crate::pipeline::{self, author_of, Env, HandlerContext, Pipeline, Principal};
use crate::store::{ChangeSet, EntityStore, LocalStore, NewJob, RetrievingStore, StagingStore};
use crate::token::{peek_claims, verify_token};
use crate::triple_store::EntityDb;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use fedgraph_protocol::{DeliveryPayload, FetchPayload, ACTION_DELIVER, ACTION_FETCH_ENTITY};
use http::{HeaderMap, Method, Uri};
use rand::RngCore as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Installs the fmt subscriber once; later calls are no-ops.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("static directive")),
        )
        .try_init()
        .ok();
}

/// One federated node: storage, keys, queue and HTTP client behind a cheap handle.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    config: ServerConfig,
    ctx: Arc<JsonLdContext>,
    converters: ConverterRegistry,
    db: EntityDb,
    notify: NotifyHub,
    keys: KeyStore,
    queue: JobQueue,
    http: reqwest::Client,
    fetcher: RemoteFetcher,
    local_host: Option<String>,
}

impl Node {
    pub fn open(config: ServerConfig) -> Result<Self> {
        let db_path = config.db_path()?;
        let ctx = Arc::new(JsonLdContext::activity_streams());
        let db = EntityDb::open(&db_path, ctx.clone())?;
        let queue = JobQueue::open(&db_path, config.queue.clone())?;
        let keys = KeyStore::open(&db_path, config.actor_key_bits)?;
        let notify = NotifyHub::new();
        queue.attach(&notify);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs.clamp(1, 300)))
            .user_agent(config.user_agent.clone())
            .build()
            .context("build http client")?;
        let converters = ConverterRegistry::with_defaults(ctx.clone());
        let fetcher = RemoteFetcher::new(http.clone(), converters.clone());
        let local_host = host_of(config.base());
        info!("node {} db: {}", config.base(), db_path.display());

        Ok(Self {
            inner: Arc::new(NodeInner {
                config,
                ctx,
                converters,
                db,
                notify,
                keys,
                queue,
                http,
                fetcher,
                local_host,
            }),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn context(&self) -> &JsonLdContext {
        &self.inner.ctx
    }

    pub fn converters(&self) -> &ConverterRegistry {
        &self.inner.converters
    }

    pub fn db(&self) -> &EntityDb {
        &self.inner.db
    }

    pub fn notify(&self) -> &NotifyHub {
        &self.inner.notify
    }

    pub fn keys(&self) -> &KeyStore {
        &self.inner.keys
    }

    pub fn queue(&self) -> &JobQueue {
        &self.inner.queue
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.inner.http
    }

    /// Whether `id` lives on this node's origin.
    pub fn is_local(&self, id: &str) -> bool {
        self.inner.local_host.is_some() && host_of(id) == self.inner.local_host
    }

    /// Fresh id under an actor, e.g. `<actor>/activities/<hex>`.
    pub fn mint_id(&self, actor: &str, kind: &str) -> String {
        let mut b = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut b);
        format!("{}/{kind}/{}", actor.trim_end_matches('/'), hex::encode(b))
    }

    pub fn local_store(&self) -> LocalStore {
        LocalStore::new(self.inner.db.clone(), self.inner.notify.clone())
    }

    fn chain(&self, signer: Option<SignedFetchConfig>) -> StagingStore {
        let retrieving = RetrievingStore::new(
            Box::new(self.local_store()),
            self.inner.fetcher.clone(),
            self.config().base(),
            signer,
        );
        StagingStore::new(Box::new(retrieving))
    }

    /// New transaction whose remote fetches are unsigned.
    pub fn begin_unsigned(&self) -> StagingStore {
        self.chain(None)
    }

    /// New transaction; remote fetches are signed as `as_actor` when it is a
    /// local actor with a key.
    pub async fn begin(&self, as_actor: Option<&str>) -> Result<StagingStore> {
        let signer = match as_actor {
            Some(a) if self.is_local(a) => self
                .inner
                .keys
                .get(a)
                .await?
                .as_ref()
                .map(SignedFetchConfig::from),
            _ => None,
        };
        Ok(self.chain(signer))
    }

    pub async fn provision_actor(&self, new_actor: &NewActor) -> Result<APEntity> {
        let store = self.begin_unsigned();
        let entity = actor::provision_actor(&store, &self.inner.keys, self.config().base(), new_actor).await?;
        store.commit_changes().await?;
        info!(actor = %entity.id, "actor provisioned");
        Ok(entity)
    }

    /// Parses a request body with the converter registered for `content_type`.
    pub fn parse_document(&self, content_type: &str, body: &[u8]) -> PipelineResult<ASObject> {
        let converter = self
            .inner
            .converters
            .for_content_type(content_type)
            .ok_or_else(|| PipelineError::validation(format!("unsupported media type: {content_type}")))?;
        converter
            .parse(body)
            .map_err(|e| PipelineError::validation(format!("unparsable document: {e:#}")))
    }

    /// Client-to-server: `principal` posts `doc` to `actor_id`'s outbox.
    /// Returns the id of the stored activity.
    pub async fn post_outbox(&self, actor_id: &str, doc: ASObject, principal: Principal) -> PipelineResult<String> {
        let store = self.begin(Some(actor_id)).await?;
        let env = Env { node: self, store: &store };
        let outbox = pipeline::actor_collection(&env, actor_id, "outbox").await?;
        let ctx = HandlerContext::new(doc, actor_id, &outbox, Some(principal));
        let done = pipeline::run_and_commit(&Pipeline::client_to_server(), &env, ctx)
            .await
            .map_err(|e| log_rejection("outbox", e))?;
        done.activity_id()
    }

    /// Server-to-server: an authenticated remote posts `doc` to a local inbox.
    pub async fn receive_inbox(&self, inbox: &str, doc: ASObject, principal: Principal) -> PipelineResult<String> {
        let owner = {
            let store = self.begin_unsigned();
            let env = Env { node: self, store: &store };
            pipeline::inbox_owner(&env, inbox).await?
        };
        let store = self.begin(Some(&owner)).await?;
        let env = Env { node: self, store: &store };
        let ctx = HandlerContext::new(doc, &owner, inbox, Some(principal));
        let done = pipeline::run_and_commit(&Pipeline::server_to_server(), &env, ctx)
            .await
            .map_err(|e| log_rejection("inbox", e))?;
        done.activity_id()
    }

    /// Loopback delivery of a stored activity into a local inbox, in its own
    /// transaction.
    pub async fn receive_local(&self, inbox: &str, activity_id: &str, sender: &str) -> PipelineResult<()> {
        let store = self.begin_unsigned();
        let env = Env { node: self, store: &store };
        match pipeline::deliver_local(&env, inbox, activity_id, Principal::new(sender)).await {
            Ok(_) => {
                store.commit_changes().await?;
                Ok(())
            }
            Err(e) => {
                store.discard().await;
                Err(log_rejection("loopback", e))
            }
        }
    }

    /// Authenticates an inbound request by its HTTP Signature, or by a bearer
    /// token when no signature is present. Keys are resolved through the
    /// layered store, fetching the signer when it is not cached.
    pub async fn verify_inbound_request(
        &self,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: &[u8],
    ) -> PipelineResult<Principal> {
        let store = self.begin_unsigned();
        let audience = self.request_url(uri);
        let max_skew = Duration::from_secs(self.config().max_date_skew_secs);

        if let Some(sig) = headers.get("Signature").and_then(|v| v.to_str().ok()) {
            let params = parse_signature_header(sig).map_err(|e| PipelineError::forbidden(format!("{e:#}")))?;
            let actor_id = params.actor_id().to_string();
            let pem = self.public_key_of(&store, &actor_id, Some(&params.key_id)).await?;
            verify_request(&params, &pem, method, uri, headers, body, max_skew)
                .map_err(|e| PipelineError::forbidden(format!("bad signature: {e:#}")))?;
            if let Some(token) = bearer_token(headers) {
                verify_token(token, &pem, &audience)
                    .map_err(|e| PipelineError::forbidden(format!("bad token: {e:#}")))?;
            }
            return Ok(Principal::new(actor_id));
        }

        let token = bearer_token(headers).ok_or_else(|| PipelineError::forbidden("request is not signed"))?;
        let claims = peek_claims(token).map_err(|e| PipelineError::forbidden(format!("{e:#}")))?;
        let pem = self.public_key_of(&store, &claims.iss, None).await?;
        let claims = verify_token(token, &pem, &audience)
            .map_err(|e| PipelineError::forbidden(format!("bad token: {e:#}")))?;
        Ok(Principal::new(claims.iss))
    }

    /// Absolute URL of a request target; origin-form URIs are taken relative to `base_uri`.
    fn request_url(&self, uri: &Uri) -> String {
        match (uri.scheme_str(), uri.authority()) {
            (Some(scheme), Some(auth)) => format!("{scheme}://{auth}{}", uri.path()),
            _ => format!("{}{}", self.config().base(), uri.path()),
        }
    }

    async fn public_key_of(&self, store: &StagingStore, actor_id: &str, key_id: Option<&str>) -> PipelineResult<String> {
        let actor = store
            .get_entity(actor_id, true)
            .await?
            .ok_or_else(|| PipelineError::forbidden(format!("unknown signer: {actor_id}")))?;
        let key_id = match key_id {
            Some(k) => k.to_string(),
            None => actor
                .data
                .first_id("publicKey")
                .map(str::to_string)
                .ok_or_else(|| PipelineError::forbidden(format!("{actor_id} has no key")))?,
        };
        let key = store
            .get_entity(&key_id, false)
            .await?
            .filter(|k| k.data.first_id("owner") == Some(actor_id))
            .ok_or_else(|| PipelineError::forbidden(format!("unknown key: {key_id}")))?;
        key.data
            .first_str("publicKeyPem")
            .map(str::to_string)
            .ok_or_else(|| PipelineError::forbidden(format!("key without pem: {key_id}")))
    }

    /// Serializes an entity for a GET, in the best media type for `accept`.
    /// Owner-only fields are shown when `viewer` is the entity's author.
    pub async fn render(
        &self,
        id: &str,
        depth: Option<u32>,
        viewer: Option<&str>,
        accept: Option<&str>,
    ) -> Result<Option<(Vec<u8>, &'static str)>> {
        let (converter, media_type) = self
            .inner
            .converters
            .negotiate(accept)
            .ok_or_else(|| anyhow!("no acceptable media type"))?;
        let store = self.local_store();
        let Some(entity) = store.get_entity(id, false).await? else {
            return Ok(None);
        };
        let is_owner = entity.is_owner
            && viewer.is_some()
            && (viewer == author_of(&entity.data).as_deref() || viewer == Some(entity.id.as_str()));
        let depth = self.config().effective_depth(depth);
        let Some(doc) = unflatten(&store, id, depth, is_owner).await? else {
            return Ok(None);
        };
        Ok(Some((converter.render(&doc)?, media_type)))
    }

    /// Queues a background refresh of a cached remote entity.
    pub async fn queue_refresh(&self, entity_id: &str, as_actor: Option<&str>) -> Result<()> {
        let payload = FetchPayload {
            entity_id: entity_id.to_string(),
            as_actor: as_actor.map(str::to_string),
        };
        self.local_store()
            .apply(ChangeSet {
                jobs: vec![NewJob {
                    action: ACTION_FETCH_ENTITY.to_string(),
                    payload: serde_json::to_string(&payload)?,
                    delay_ms: 0,
                }],
                ..ChangeSet::default()
            })
            .await
    }

    pub async fn reconcile_visibility(&self) -> Result<usize> {
        collections::reconcile_visibility(&self.inner.db).await
    }

    pub fn start_worker(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        self.inner.queue.start_worker(shutdown, Arc::new(self.clone()))
    }

    /// Runs every due job (and the jobs they enqueue) to completion.
    pub async fn run_until_idle(&self) -> Result<usize> {
        self.inner.queue.run_until_idle(self).await
    }

    async fn refresh(&self, payload: &FetchPayload) -> Result<(), JobError> {
        let signer = match payload.as_actor.as_deref() {
            Some(a) => self.inner.keys.get(a).await?.as_ref().map(SignedFetchConfig::from),
            None => None,
        };
        let store = RetrievingStore::new(
            Box::new(self.local_store()),
            self.inner.fetcher.clone(),
            self.config().base(),
            signer,
        );
        match store.refresh(&payload.entity_id).await? {
            Some(_) => debug!(id = %payload.entity_id, "entity refreshed"),
            None => debug!(id = %payload.entity_id, "entity not refreshable"),
        }
        Ok(())
    }
}

#[async_trait]
impl JobExecutor for Node {
    fn begin(&self) -> StagingStore {
        self.begin_unsigned()
    }

    async fn execute(&self, store: &StagingStore, job: &Job) -> Result<(), JobError> {
        match job.action.as_str() {
            ACTION_DELIVER => {
                let payload: DeliveryPayload = serde_json::from_str(&job.payload)
                    .map_err(|e| JobError::Permanent(format!("bad deliver payload: {e}")))?;
                delivery::deliver(self, store, &payload).await
            }
            ACTION_FETCH_ENTITY => {
                let payload: FetchPayload = serde_json::from_str(&job.payload)
                    .map_err(|e| JobError::Permanent(format!("bad fetch payload: {e}")))?;
                self.refresh(&payload).await
            }
            other => Err(JobError::Permanent(format!("unknown action: {other}"))),
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

fn log_rejection(surface: &str, e: PipelineError) -> PipelineError {
    if e.is_rejection() {
        info!(surface, "activity rejected: {e}");
    } else {
        warn!(surface, "activity failed: {e:#}");
    }
    e
}
