/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use async_trait::async_trait;
use fedgraph_core::actor::NewActor;
use fedgraph_core::collections::CollectionTools;
use fedgraph_core::config::ServerConfig;
use fedgraph_core::http_sig::{sign_request_rsa_sha256, FETCH_SIGNED_HEADERS};
use fedgraph_core::object::{ASObject, ASTerm};
use fedgraph_core::pipeline::{
    run_and_commit, store_tree, Env, Flow, Handler, HandlerContext, Ownership, Pipeline, Principal,
};
use fedgraph_core::store::EntityStore;
use fedgraph_core::{Node, PipelineError, PipelineResult};
use fedgraph_protocol::AS_PUBLIC;
use http::{HeaderMap, Method, Uri};

const ALICE: &str = "https://a.example/users/alice";
const BOB: &str = "https://a.example/users/bob";

async fn node(dir: &std::path::Path) -> Node {
    let cfg = ServerConfig {
        base_uri: "https://a.example".to_string(),
        data_dir: Some(dir.to_string_lossy().into_owned()),
        actor_key_bits: 1024,
        ..ServerConfig::default()
    };
    let node = Node::open(cfg).unwrap();
    node.provision_actor(&NewActor::person("alice")).await.unwrap();
    node.provision_actor(&NewActor::person("bob")).await.unwrap();
    node
}

async fn member(node: &Node, collection: &str, element: &str) -> bool {
    let store = node.local_store();
    CollectionTools::new(&store).contains(collection, element).await.unwrap()
}

fn follow(target: &str) -> ASObject {
    let mut f = ASObject::typed("Follow", None);
    f.set("object", ASTerm::reference(target));
    f
}

/// Posts a public note as alice and returns the note id.
async fn alice_note(node: &Node, content: &str) -> String {
    let mut note = ASObject::typed("Note", None);
    note.set("content", ASTerm::string(content));
    note.set("to", ASTerm::reference(AS_PUBLIC));
    let create_id = node.post_outbox(ALICE, note, Principal::new(ALICE)).await.unwrap();
    let create = node.local_store().get_entity(&create_id, false).await.unwrap().unwrap();
    create.data.first_id("object").unwrap().to_string()
}

#[tokio::test]
async fn follow_is_auto_accepted_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let node = node(dir.path()).await;

    let follow_id = node.post_outbox(BOB, follow(ALICE), Principal::new(BOB)).await.unwrap();
    assert!(member(&node, &format!("{BOB}/outbox"), &follow_id).await);

    // Follow into alice's inbox, then the Accept back into bob's.
    assert_eq!(node.run_until_idle().await.unwrap(), 2);

    assert!(member(&node, &format!("{ALICE}/inbox"), &follow_id).await);
    assert!(member(&node, &format!("{ALICE}/followers"), BOB).await);
    assert!(member(&node, &format!("{BOB}/following"), ALICE).await);
    assert_eq!(node.queue().stats().await.unwrap().pending, 0);
}

#[tokio::test]
async fn manual_approval_leaves_follow_pending() {
    let dir = tempfile::tempdir().unwrap();
    let node = node(dir.path()).await;
    node.provision_actor(&NewActor {
        manually_approves_followers: true,
        ..NewActor::person("carol")
    })
    .await
    .unwrap();
    let carol = "https://a.example/users/carol";

    let follow_id = node.post_outbox(BOB, follow(carol), Principal::new(BOB)).await.unwrap();
    assert_eq!(node.run_until_idle().await.unwrap(), 1);
    assert!(member(&node, &format!("{carol}/inbox"), &follow_id).await);
    assert!(!member(&node, &format!("{carol}/followers"), BOB).await);
}

#[tokio::test]
async fn deleted_objects_become_tombstones_and_stay_taken() {
    let dir = tempfile::tempdir().unwrap();
    let node = node(dir.path()).await;
    let note_id = alice_note(&node, "short lived").await;

    let mut delete = ASObject::typed("Delete", None);
    delete.set("object", ASTerm::reference(note_id.clone()));
    node.post_outbox(ALICE, delete, Principal::new(ALICE)).await.unwrap();

    let stored = node.local_store().get_entity(&note_id, false).await.unwrap().unwrap();
    assert!(stored.is_tombstone());
    assert!(!stored.data.contains("content"));
    assert_eq!(stored.data.first_str("formerType"), Some("Note"));

    let mut again = ASObject::typed("Note", Some(note_id.clone()));
    again.set("content", ASTerm::string("back from the dead"));
    let mut create = ASObject::typed("Create", None);
    create.set("object", ASTerm::Object(again));
    let err = node.post_outbox(ALICE, create, Principal::new(ALICE)).await.unwrap_err();
    assert!(matches!(err, PipelineError::Validation(_)), "{err}");
}

#[tokio::test]
async fn update_cannot_change_the_author() {
    let dir = tempfile::tempdir().unwrap();
    let node = node(dir.path()).await;
    let note_id = alice_note(&node, "original").await;

    let mut patch = ASObject::typed("Note", Some(note_id.clone()));
    patch.set("content", ASTerm::string("hijacked"));
    patch.set("attributedTo", ASTerm::reference(BOB));
    let mut update = ASObject::typed("Update", None);
    update.set("object", ASTerm::Object(patch));
    let err = node.post_outbox(ALICE, update, Principal::new(ALICE)).await.unwrap_err();
    assert!(matches!(err, PipelineError::Validation(_)), "{err}");

    let stored = node.local_store().get_entity(&note_id, false).await.unwrap().unwrap();
    assert_eq!(stored.data.first_str("content"), Some("original"));
    let store = node.local_store();
    let outbox = CollectionTools::new(&store)
        .page(&format!("{ALICE}/outbox"), None, 10, true)
        .await
        .unwrap();
    assert_eq!(outbox.total, 1);
}

#[tokio::test]
async fn update_replaces_content_and_keeps_author() {
    let dir = tempfile::tempdir().unwrap();
    let node = node(dir.path()).await;
    let note_id = alice_note(&node, "draft").await;

    let mut patch = ASObject::typed("Note", Some(note_id.clone()));
    patch.set("content", ASTerm::string("final"));
    let mut update = ASObject::typed("Update", None);
    update.set("object", ASTerm::Object(patch));
    node.post_outbox(ALICE, update, Principal::new(ALICE)).await.unwrap();

    let stored = node.local_store().get_entity(&note_id, false).await.unwrap().unwrap();
    assert_eq!(stored.data.first_str("content"), Some("final"));
    assert_eq!(stored.data.first_id("attributedTo"), Some(ALICE));
    assert!(stored.data.contains("updated"));
}

#[tokio::test]
async fn posting_for_someone_else_is_forbidden() {
    let dir = tempfile::tempdir().unwrap();
    let node = node(dir.path()).await;
    let err = node
        .post_outbox(ALICE, follow(BOB), Principal::new(BOB))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Forbidden(_)), "{err}");
}

struct StoreScratch;

#[async_trait]
impl Handler for StoreScratch {
    fn name(&self) -> &'static str {
        "store_scratch"
    }

    async fn handle(&self, env: &Env<'_>, ctx: HandlerContext) -> PipelineResult<Flow> {
        let scratch = ASObject::typed("Note", Some("https://a.example/scratch".to_string()));
        store_tree(env, &scratch, Ownership::Owned(ALICE)).await?;
        Ok(Flow::Continue(ctx))
    }
}

struct Refuse;

#[async_trait]
impl Handler for Refuse {
    fn name(&self) -> &'static str {
        "refuse"
    }

    async fn handle(&self, _env: &Env<'_>, _ctx: HandlerContext) -> PipelineResult<Flow> {
        Err(PipelineError::validation("refused"))
    }
}

#[tokio::test]
async fn aborted_pipeline_leaves_no_trace() {
    let dir = tempfile::tempdir().unwrap();
    let node = node(dir.path()).await;
    let store = node.begin_unsigned();
    let env = Env { node: &node, store: &store };
    let pipeline = Pipeline::new(vec![Box::new(StoreScratch), Box::new(Refuse)]);
    assert_eq!(pipeline.handler_names(), vec!["store_scratch", "refuse"]);

    let ctx = HandlerContext::new(follow(BOB), ALICE, &format!("{ALICE}/outbox"), None);
    assert!(run_and_commit(&pipeline, &env, ctx).await.is_err());
    assert!(!store.has_changes().await);
    assert!(node
        .local_store()
        .get_entity("https://a.example/scratch", false)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn blocked_actors_cannot_follow() {
    let dir = tempfile::tempdir().unwrap();
    let node = node(dir.path()).await;
    let mut block = ASObject::typed("Block", None);
    block.set("object", ASTerm::reference(BOB));
    node.post_outbox(ALICE, block, Principal::new(ALICE)).await.unwrap();
    assert!(member(&node, &format!("{ALICE}/blocks"), BOB).await);
    // Blocks are never delivered.
    assert_eq!(node.queue().stats().await.unwrap().pending, 0);

    let follow_id = node.post_outbox(BOB, follow(ALICE), Principal::new(BOB)).await.unwrap();
    assert_eq!(node.run_until_idle().await.unwrap(), 1);
    assert!(!member(&node, &format!("{ALICE}/inbox"), &follow_id).await);
    assert!(!member(&node, &format!("{ALICE}/followers"), BOB).await);
    assert!(!member(&node, &format!("{BOB}/following"), ALICE).await);
}

#[tokio::test]
async fn likes_land_in_the_note_likes_collection() {
    let dir = tempfile::tempdir().unwrap();
    let node = node(dir.path()).await;
    let note_id = alice_note(&node, "like me").await;

    let mut like = ASObject::typed("Like", None);
    like.set("object", ASTerm::reference(note_id.clone()));
    like.set("to", ASTerm::reference(ALICE));
    let like_id = node.post_outbox(BOB, like, Principal::new(BOB)).await.unwrap();
    assert!(member(&node, &format!("{BOB}/liked"), &note_id).await);

    assert_eq!(node.run_until_idle().await.unwrap(), 1);
    assert!(member(&node, &format!("{note_id}/likes"), &like_id).await);
}

#[tokio::test]
async fn signed_requests_authenticate_their_actor() {
    let dir = tempfile::tempdir().unwrap();
    let node = node(dir.path()).await;
    let key = node.keys().get(ALICE).await.unwrap().unwrap();

    let uri: Uri = "https://a.example/users/bob/inbox".parse().unwrap();
    let body = br#"{"type":"Note"}"#;
    let mut headers = HeaderMap::new();
    sign_request_rsa_sha256(
        &key.private_key_pem,
        &key.key_id,
        &Method::POST,
        &uri,
        &mut headers,
        body,
        FETCH_SIGNED_HEADERS,
    )
    .unwrap();

    let principal = node
        .verify_inbound_request(&Method::POST, &uri, &headers, body)
        .await
        .unwrap();
    assert_eq!(principal, Principal::new(ALICE));

    let err = node
        .verify_inbound_request(&Method::POST, &uri, &headers, br#"{"type":"Tampered"}"#)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Forbidden(_)), "{err}");

    let err = node
        .verify_inbound_request(&Method::POST, &uri, &HeaderMap::new(), body)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Forbidden(_)), "{err}");
}

#[tokio::test]
async fn rendering_hides_private_addressing_from_strangers() {
    let dir = tempfile::tempdir().unwrap();
    let node = node(dir.path()).await;
    let mut note = ASObject::typed("Note", None);
    note.set("content", ASTerm::string("for bob only"));
    note.set("bto", ASTerm::reference(BOB));
    let create_id = node.post_outbox(ALICE, note, Principal::new(ALICE)).await.unwrap();
    let create = node.local_store().get_entity(&create_id, false).await.unwrap().unwrap();
    let note_id = create.data.first_id("object").unwrap().to_string();

    let (owner_view, _) = node.render(&note_id, Some(0), Some(ALICE), None).await.unwrap().unwrap();
    let (stranger_view, _) = node.render(&note_id, Some(0), None, None).await.unwrap().unwrap();
    let owner_view: serde_json::Value = serde_json::from_slice(&owner_view).unwrap();
    let stranger_view: serde_json::Value = serde_json::from_slice(&stranger_view).unwrap();
    assert!(owner_view.get("bto").is_some());
    assert!(stranger_view.get("bto").is_none());
    assert_eq!(stranger_view["content"], "for bob only");
}

#[tokio::test]
async fn embedded_objects_of_other_authors_are_not_overwritten() {
    let dir = tempfile::tempdir().unwrap();
    let node = node(dir.path()).await;
    let mut bobs = ASObject::typed("Note", None);
    bobs.set("content", ASTerm::string("bob original"));
    let create_id = node.post_outbox(BOB, bobs, Principal::new(BOB)).await.unwrap();
    let create = node.local_store().get_entity(&create_id, false).await.unwrap().unwrap();
    let bob_note = create.data.first_id("object").unwrap().to_string();

    let mut forged = ASObject::typed("Note", Some(bob_note.clone()));
    forged.set("content", ASTerm::string("rewritten by alice"));
    forged.set("attributedTo", ASTerm::reference(ALICE));
    let mut note = ASObject::typed("Note", None);
    note.set("content", ASTerm::string("look at this"));
    note.set("attachment", ASTerm::Object(forged));
    let create_id = node.post_outbox(ALICE, note, Principal::new(ALICE)).await.unwrap();

    let store = node.local_store();
    let kept = store.get_entity(&bob_note, false).await.unwrap().unwrap();
    assert_eq!(kept.data.first_str("content"), Some("bob original"));
    assert_eq!(kept.data.first_id("attributedTo"), Some(BOB));

    let create = store.get_entity(&create_id, false).await.unwrap().unwrap();
    let alice_note = store
        .get_entity(create.data.first_id("object").unwrap(), false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(alice_note.data.first_id("attachment"), Some(bob_note.as_str()));
}

#[tokio::test]
async fn owned_nested_objects_of_the_same_author_are_updated() {
    let dir = tempfile::tempdir().unwrap();
    let node = node(dir.path()).await;
    let first = alice_note(&node, "first").await;

    let mut again = ASObject::typed("Note", Some(first.clone()));
    again.set("content", ASTerm::string("first, edited"));
    again.set("attributedTo", ASTerm::reference(ALICE));
    let mut note = ASObject::typed("Note", None);
    note.set("content", ASTerm::string("second"));
    note.set("attachment", ASTerm::Object(again));
    node.post_outbox(ALICE, note, Principal::new(ALICE)).await.unwrap();

    let kept = node.local_store().get_entity(&first, false).await.unwrap().unwrap();
    assert_eq!(kept.data.first_str("content"), Some("first, edited"));
}

#[tokio::test]
async fn inbound_documents_cannot_plant_objects_of_other_origins() {
    const EVE: &str = "https://evil.example/users/eve";
    const VICTIM: &str = "https://victim.example/notes/9";
    let dir = tempfile::tempdir().unwrap();
    let node = node(dir.path()).await;
    let planted_local = format!("{ALICE}/objects/planted");

    let mut foreign = ASObject::typed("Note", Some(VICTIM.to_string()));
    foreign.set("content", ASTerm::string("forged"));
    foreign.set("attributedTo", ASTerm::reference("https://victim.example/users/vic"));
    let mut local = ASObject::typed("Note", Some(planted_local.clone()));
    local.set("attributedTo", ASTerm::reference(ALICE));
    let mut same_origin = ASObject::typed("Image", Some("https://evil.example/media/1".to_string()));
    same_origin.set("url", ASTerm::reference("https://evil.example/media/1.png"));

    let mut note = ASObject::typed("Note", Some("https://evil.example/notes/1".to_string()));
    note.set("attributedTo", ASTerm::reference(EVE));
    note.set("content", ASTerm::string("hello"));
    note.add("tag", ASTerm::Object(foreign));
    note.add("tag", ASTerm::Object(local));
    note.set("attachment", ASTerm::Object(same_origin));
    let mut create = ASObject::typed("Create", Some("https://evil.example/activities/1".to_string()));
    create.set("actor", ASTerm::reference(EVE));
    create.set("object", ASTerm::Object(note));
    create.set("to", ASTerm::reference(ALICE));

    let inbox = format!("{ALICE}/inbox");
    node.receive_inbox(&inbox, create, Principal::new(EVE)).await.unwrap();

    let store = node.local_store();
    let cached = store
        .get_entity("https://evil.example/notes/1", false)
        .await
        .unwrap()
        .unwrap();
    assert!(!cached.is_owner);
    let tags = cached.data.ids("tag");
    assert!(tags.contains(&VICTIM.to_string()) && tags.contains(&planted_local));
    assert!(store.get_entity(VICTIM, false).await.unwrap().is_none());
    assert!(store.get_entity(&planted_local, false).await.unwrap().is_none());
    assert!(store
        .get_entity("https://evil.example/media/1", false)
        .await
        .unwrap()
        .is_some());
    assert!(member(&node, &inbox, "https://evil.example/activities/1").await);
}
