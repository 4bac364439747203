/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use super::{public_collection, ChangeSet, CollectionPage, EntityStore};
use crate::flattener::flatten;
use crate::object::{host_of, APEntity};
use crate::object_fetch::{RemoteFetcher, SignedFetchConfig};
use anyhow::Result;
use async_trait::async_trait;
use fedgraph_protocol::AS_PUBLIC;
use tracing::{debug, warn};

/// Fetches and caches remote entities on a local miss.
pub struct RetrievingStore {
    next: Box<dyn EntityStore>,
    fetcher: RemoteFetcher,
    local_host: Option<String>,
    signer: Option<SignedFetchConfig>,
}

impl RetrievingStore {
    pub fn new(
        next: Box<dyn EntityStore>,
        fetcher: RemoteFetcher,
        base_uri: &str,
        signer: Option<SignedFetchConfig>,
    ) -> Self {
        Self {
            next,
            fetcher,
            local_host: host_of(base_uri),
            signer,
        }
    }

    /// Only foreign http(s) ids are ever fetched.
    pub fn is_remote(&self, id: &str) -> bool {
        if !(id.starts_with("https://") || id.starts_with("http://")) {
            return false;
        }
        match host_of(id) {
            Some(h) => h != "localhost" && Some(&h) != self.local_host.as_ref(),
            None => false,
        }
    }

    /// Re-fetches a cached remote entity, replacing it wholesale. Owned
    /// entities are returned untouched.
    pub async fn refresh(&self, id: &str) -> Result<Option<APEntity>> {
        if let Some(existing) = self.next.get_entity(id, false).await? {
            if existing.is_owner {
                return Ok(Some(existing));
            }
        }
        if !self.is_remote(id) {
            return Ok(None);
        }
        self.fetch_and_store(id).await
    }

    async fn fetch_and_store(&self, url: &str) -> Result<Option<APEntity>> {
        let doc = match self.fetcher.fetch(url, self.signer.as_ref()).await {
            Ok(Some(doc)) => doc,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!(url, "remote fetch failed: {e:#}");
                return Ok(None);
            }
        };

        let root_id = doc.id.clone().unwrap_or_else(|| url.to_string());
        let origin = host_of(url);
        if host_of(&root_id) != origin {
            warn!(url, root_id, "fetched document claims a foreign id");
            return Ok(None);
        }
        let mut doc = doc;
        doc.id = Some(root_id.clone());

        let mut changes = ChangeSet::default();
        for node in flatten(&doc)?.nodes {
            let Some(id) = node.id.clone() else { continue };
            // Foreign sub-objects stay references; the origin must be asked for them.
            if host_of(&id) != origin || !self.is_remote(&id) {
                debug!(url, id, "skipping sub-object from another origin");
                continue;
            }
            if let Some(existing) = self.next.get_entity(&id, false).await? {
                if existing.is_owner {
                    continue;
                }
            }
            changes.put_entity(APEntity::new(node, false)?);
        }
        self.next.apply(changes).await?;
        self.next.commit_changes().await?;
        self.next.get_entity(&root_id, false).await
    }
}

#[async_trait]
impl EntityStore for RetrievingStore {
    async fn get_entity(&self, id: &str, allow_remote: bool) -> Result<Option<APEntity>> {
        if id == AS_PUBLIC {
            return Ok(Some(public_collection()));
        }
        if let Some(e) = self.next.get_entity(id, false).await? {
            return Ok(Some(e));
        }
        if !allow_remote || !self.is_remote(id) {
            return Ok(None);
        }
        self.fetch_and_store(id).await
    }

    async fn store_entity(&self, entity: APEntity) -> Result<APEntity> {
        self.next.store_entity(entity).await
    }

    async fn apply(&self, changes: ChangeSet) -> Result<()> {
        self.next.apply(changes).await
    }

    async fn commit_changes(&self) -> Result<()> {
        self.next.commit_changes().await
    }

    async fn collection_contains(&self, collection: &str, element: &str) -> Result<bool> {
        self.next.collection_contains(collection, element).await
    }

    async fn collection_page(
        &self,
        collection: &str,
        after: Option<i64>,
        limit: usize,
        include_private: bool,
    ) -> Result<CollectionPage> {
        self.next
            .collection_page(collection, after, limit, include_private)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::JsonLdContext;
    use crate::converter::ConverterRegistry;
    use crate::notify::NotifyHub;
    use crate::store::LocalStore;
    use crate::object::ASObject;
    use crate::triple_store::EntityDb;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn store_at(dir: &std::path::Path) -> (LocalStore, RetrievingStore) {
        let ctx = Arc::new(JsonLdContext::default());
        let db = EntityDb::open(dir.join("r.db"), ctx.clone()).unwrap();
        let http = reqwest::Client::builder().no_proxy().build().unwrap();
        let fetcher = RemoteFetcher::new(http, ConverterRegistry::with_defaults(ctx));
        let local = LocalStore::new(db, NotifyHub::new());
        let retrieving = RetrievingStore::new(Box::new(local.clone()), fetcher, "https://a.example", None);
        (local, retrieving)
    }

    fn store(dir: &std::path::Path) -> RetrievingStore {
        store_at(dir).1
    }

    /// Plain HTTP/1.1 server on loopback answering GETs from a path table.
    struct Origin {
        base: String,
        docs: Arc<Mutex<HashMap<String, String>>>,
        hits: Arc<AtomicUsize>,
    }

    impl Origin {
        async fn start() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let base = format!("http://{}", listener.local_addr().unwrap());
            let docs = Arc::new(Mutex::new(HashMap::<String, String>::new()));
            let hits = Arc::new(AtomicUsize::new(0));
            let (table, counter) = (docs.clone(), hits.clone());
            tokio::spawn(async move {
                while let Ok((mut sock, _)) = listener.accept().await {
                    let (table, counter) = (table.clone(), counter.clone());
                    tokio::spawn(async move {
                        let mut buf = vec![0u8; 8192];
                        let mut len = 0;
                        while !buf[..len].windows(4).any(|w| w == b"\r\n\r\n") {
                            match sock.read(&mut buf[len..]).await {
                                Ok(0) | Err(_) => return,
                                Ok(n) => len += n,
                            }
                        }
                        let head = String::from_utf8_lossy(&buf[..len]).into_owned();
                        let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();
                        counter.fetch_add(1, Ordering::SeqCst);
                        let body = table.lock().unwrap().get(&path).cloned();
                        let resp = match body {
                            Some(b) => format!(
                                "HTTP/1.1 200 OK\r\nContent-Type: application/activity+json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{b}",
                                b.len()
                            ),
                            None => "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string(),
                        };
                        let _ = sock.write_all(resp.as_bytes()).await;
                        let _ = sock.shutdown().await;
                    });
                }
            });
            Self { base, docs, hits }
        }

        fn url(&self, path: &str) -> String {
            format!("{}{path}", self.base)
        }

        fn serve(&self, path: &str, doc: serde_json::Value) {
            self.docs.lock().unwrap().insert(path.to_string(), doc.to_string());
        }

        fn hits(&self) -> usize {
            self.hits.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn local_and_loopback_ids_are_never_fetched() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        assert!(!s.is_remote("https://a.example/users/alice"));
        assert!(!s.is_remote("http://localhost:8080/users/x"));
        assert!(!s.is_remote("urn:uuid:1234"));
        assert!(s.is_remote("https://b.example/users/bob"));
        assert!(s.get_entity("https://a.example/missing", true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn public_collection_is_synthesized() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let p = s.get_entity(AS_PUBLIC, true).await.unwrap().unwrap();
        assert_eq!(p.type_name, "Collection");
        assert!(!p.is_owner);
    }

    #[tokio::test]
    async fn missing_remote_documents_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let origin = Origin::start().await;
        let s = store(dir.path());
        assert!(s.get_entity(&origin.url("/notes/none"), true).await.unwrap().is_none());
        assert_eq!(origin.hits(), 1);

        // Nothing listens on the port any more once the listener is gone.
        let closed = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            format!("http://{}/notes/1", l.local_addr().unwrap())
        };
        assert!(s.get_entity(&closed, true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fetched_documents_are_cached_without_foreign_sub_objects() {
        let dir = tempfile::tempdir().unwrap();
        let origin = Origin::start().await;
        let note = origin.url("/notes/1");
        let image = origin.url("/media/1");
        origin.serve(
            "/notes/1",
            serde_json::json!({
                "id": note,
                "type": "Note",
                "content": "hello",
                "attachment": {"id": image, "type": "Image"},
                "tag": {"id": "https://c.example/notes/2", "type": "Note", "content": "forged"},
                "inReplyTo": {"id": "https://a.example/users/alice/objects/1", "type": "Note"}
            }),
        );
        let (local, s) = store_at(dir.path());

        let got = s.get_entity(&note, true).await.unwrap().unwrap();
        assert!(!got.is_owner);
        assert_eq!(got.data.first_str("content"), Some("hello"));
        assert_eq!(got.data.first_id("tag"), Some("https://c.example/notes/2"));
        assert!(local.get_entity(&image, false).await.unwrap().is_some());
        assert!(local.get_entity("https://c.example/notes/2", false).await.unwrap().is_none());
        assert!(local
            .get_entity("https://a.example/users/alice/objects/1", false)
            .await
            .unwrap()
            .is_none());

        // Served from the cache from now on.
        s.get_entity(&note, true).await.unwrap().unwrap();
        assert_eq!(origin.hits(), 1);
    }

    #[tokio::test]
    async fn documents_claiming_another_origin_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let origin = Origin::start().await;
        origin.serve(
            "/notes/1",
            serde_json::json!({"id": "https://c.example/notes/1", "type": "Note", "content": "mine"}),
        );
        let (local, s) = store_at(dir.path());
        assert!(s.get_entity(&origin.url("/notes/1"), true).await.unwrap().is_none());
        assert!(local.get_entity("https://c.example/notes/1", false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn owned_entities_are_never_fetched() {
        let dir = tempfile::tempdir().unwrap();
        let origin = Origin::start().await;
        let id = origin.url("/notes/1");
        origin.serve("/notes/1", serde_json::json!({"id": id, "type": "Note", "content": "remote"}));
        let (local, s) = store_at(dir.path());
        let mut mine = ASObject::typed("Note", Some(id.clone()));
        mine.set("content", crate::object::ASTerm::string("local"));
        local.store_entity(APEntity::new(mine, true).unwrap()).await.unwrap();

        let got = s.get_entity(&id, true).await.unwrap().unwrap();
        assert_eq!(got.data.first_str("content"), Some("local"));
        let got = s.refresh(&id).await.unwrap().unwrap();
        assert!(got.is_owner);
        assert_eq!(got.data.first_str("content"), Some("local"));
        assert_eq!(origin.hits(), 0);
    }

    #[tokio::test]
    async fn refresh_replaces_the_cached_copy_wholesale() {
        let dir = tempfile::tempdir().unwrap();
        let origin = Origin::start().await;
        let id = origin.url("/notes/1");
        origin.serve(
            "/notes/1",
            serde_json::json!({"id": id, "type": "Note", "content": "v1", "summary": "cw"}),
        );
        let s = store(dir.path());
        let first = s.get_entity(&id, true).await.unwrap().unwrap();
        assert_eq!(first.data.first_str("summary"), Some("cw"));

        origin.serve("/notes/1", serde_json::json!({"id": id, "type": "Note", "content": "v2"}));
        let fresh = s.refresh(&id).await.unwrap().unwrap();
        assert_eq!(fresh.data.first_str("content"), Some("v2"));
        assert!(!fresh.data.contains("summary"));
        assert_eq!(origin.hits(), 2);
    }
}
