/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use super::{public_collection, ChangeSet, CollectionItem, CollectionOp, CollectionPage, EntityStore};
use crate::job_queue::{delete_job, insert_job};
use crate::notify::NotifyHub;
use crate::object::{now_ms, APEntity};
use crate::triple_store::{get_entity, intern, lookup_attribute, EntityDb};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use fedgraph_protocol::{AS_PUBLIC, CHANNEL_BACKGROUND_JOB, CHANNEL_COLLECTION_CHANGED};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;

/// Bottom layer: reads and writes the triple store directly.
#[derive(Clone)]
pub struct LocalStore {
    db: EntityDb,
    notify: NotifyHub,
}

impl LocalStore {
    pub fn new(db: EntityDb, notify: NotifyHub) -> Self {
        Self { db, notify }
    }

    pub fn db(&self) -> &EntityDb {
        &self.db
    }
}

#[async_trait]
impl EntityStore for LocalStore {
    async fn get_entity(&self, id: &str, _allow_remote: bool) -> Result<Option<APEntity>> {
        if id == AS_PUBLIC {
            return Ok(Some(public_collection()));
        }
        tokio::task::spawn_blocking({
            let db = self.db.clone();
            let id = id.to_string();
            move || -> Result<Option<APEntity>> {
                let conn = db.connect()?;
                db.read_entity(&conn, &id)
            }
        })
        .await?
    }

    async fn store_entity(&self, entity: APEntity) -> Result<APEntity> {
        self.apply(ChangeSet {
            entities: vec![entity.clone()],
            ..ChangeSet::default()
        })
        .await?;
        Ok(entity)
    }

    async fn apply(&self, changes: ChangeSet) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let has_jobs = !changes.jobs.is_empty();
        let touched: BTreeSet<String> = changes
            .collection_ops
            .iter()
            .map(|op| op.collection().to_string())
            .collect();

        tokio::task::spawn_blocking({
            let db = self.db.clone();
            move || -> Result<()> {
                let mut conn = db.connect()?;
                let tx = conn.transaction()?;
                for e in changes.entities.iter().filter(|e| e.id != AS_PUBLIC) {
                    db.write_entity(&tx, e)?;
                }
                for op in &changes.collection_ops {
                    apply_collection_op(&tx, op)?;
                }
                let now = now_ms();
                for job in &changes.jobs {
                    insert_job(&tx, job, now)?;
                }
                for claim in &changes.completed_jobs {
                    delete_job(&tx, claim)?;
                }
                tx.commit()?;
                Ok(())
            }
        })
        .await??;

        if has_jobs {
            self.notify.publish(CHANNEL_BACKGROUND_JOB, "");
        }
        for c in touched {
            self.notify.publish(CHANNEL_COLLECTION_CHANGED, &c);
        }
        Ok(())
    }

    async fn commit_changes(&self) -> Result<()> {
        Ok(())
    }

    async fn collection_contains(&self, collection: &str, element: &str) -> Result<bool> {
        tokio::task::spawn_blocking({
            let db = self.db.clone();
            let collection = collection.to_string();
            let element = element.to_string();
            move || -> Result<bool> {
                let conn = db.connect()?;
                let hit: Option<i64> = conn
                    .query_row(
                        r#"
                        SELECT ci.item_id
                        FROM collection_items ci
                        JOIN entities e ON e.entity_id = ci.collection_entity
                        JOIN attributes ca ON ca.attribute_id = e.id_attr
                        JOIN attributes ea ON ea.attribute_id = ci.element_attr
                        WHERE ca.uri = ?1 AND ea.uri = ?2
                        "#,
                        params![collection, element],
                        |r| r.get(0),
                    )
                    .optional()?;
                Ok(hit.is_some())
            }
        })
        .await?
    }

    async fn collection_page(
        &self,
        collection: &str,
        after: Option<i64>,
        limit: usize,
        include_private: bool,
    ) -> Result<CollectionPage> {
        tokio::task::spawn_blocking({
            let db = self.db.clone();
            let collection = collection.to_string();
            move || -> Result<CollectionPage> {
                let conn = db.connect()?;
                read_page(&conn, &collection, after, limit, include_private)
            }
        })
        .await?
    }
}

fn apply_collection_op(conn: &Connection, op: &CollectionOp) -> Result<()> {
    match op {
        CollectionOp::Add {
            collection,
            element,
            is_public,
        } => {
            let coll_attr = intern(conn, collection)?;
            let row = get_entity(conn, coll_attr)?
                .ok_or_else(|| anyhow!("collection does not exist: {collection}"))?;
            let element_attr = intern(conn, element)?;
            conn.execute(
                r#"
                INSERT OR IGNORE INTO collection_items(collection_entity, element_attr, is_public)
                VALUES (?1, ?2, ?3)
                "#,
                params![row.entity_id, element_attr, *is_public as i64],
            )?;
        }
        CollectionOp::Remove {
            collection,
            element,
        } => {
            let (Some(coll_attr), Some(element_attr)) =
                (lookup_attribute(conn, collection)?, lookup_attribute(conn, element)?)
            else {
                return Ok(());
            };
            if let Some(row) = get_entity(conn, coll_attr)? {
                conn.execute(
                    "DELETE FROM collection_items WHERE collection_entity=?1 AND element_attr=?2",
                    params![row.entity_id, element_attr],
                )?;
            }
        }
    }
    Ok(())
}

fn read_page(
    conn: &Connection,
    collection: &str,
    after: Option<i64>,
    limit: usize,
    include_private: bool,
) -> Result<CollectionPage> {
    let total: u64 = conn.query_row(
        r#"
        SELECT COUNT(*)
        FROM collection_items ci
        JOIN entities e ON e.entity_id = ci.collection_entity
        JOIN attributes ca ON ca.attribute_id = e.id_attr
        WHERE ca.uri = ?1 AND (?2 OR ci.is_public = 1)
        "#,
        params![collection, include_private],
        |r| r.get(0),
    )?;
    if limit == 0 {
        return Ok(CollectionPage {
            total,
            items: Vec::new(),
            next: None,
        });
    }

    let mut stmt = conn.prepare(
        r#"
        SELECT ci.item_id, ea.uri, ci.is_public
        FROM collection_items ci
        JOIN entities e ON e.entity_id = ci.collection_entity
        JOIN attributes ca ON ca.attribute_id = e.id_attr
        JOIN attributes ea ON ea.attribute_id = ci.element_attr
        WHERE ca.uri = ?1 AND (?2 OR ci.is_public = 1) AND ci.item_id > ?3
        ORDER BY ci.item_id ASC
        LIMIT ?4
        "#,
    )?;
    let mut rows = stmt.query(params![
        collection,
        include_private,
        after.unwrap_or(0),
        (limit as i64).saturating_add(1)
    ])?;
    let mut items = Vec::new();
    while let Some(r) = rows.next()? {
        items.push(CollectionItem {
            item_id: Some(r.get(0)?),
            collection: collection.to_string(),
            element: r.get(1)?,
            is_public: r.get::<_, i64>(2)? != 0,
        });
    }
    let next = if items.len() > limit {
        items.truncate(limit);
        items.last().and_then(|i| i.item_id)
    } else {
        None
    };
    Ok(CollectionPage { total, items, next })
}
