/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Attribute interner and triple store.
//!
//! Every URI (entity ids, predicates, types, datatypes) is interned once in
//! `attributes`; all other tables refer to the integer id. An entity's content
//! is the set of triples whose subject is that entity.

use crate::context::{JsonLdContext, FG, RDF_TYPE, XSD};
use crate::object::{APEntity, ASObject, ASTerm, Literal};
use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

#[derive(Clone)]
pub struct EntityDb {
    path: PathBuf,
    ctx: Arc<JsonLdContext>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRow {
    pub entity_id: i64,
    pub id_attr: i64,
    pub type_name: String,
    pub updated_ms: i64,
    pub is_owner: bool,
}

/// Object position of a triple: exactly one of reference or literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TripleObject {
    Ref(i64),
    Literal { value: String, type_attr: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Triple {
    pub predicate: i64,
    pub object: TripleObject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TripleRow {
    pub triple_id: i64,
    pub subject_entity: i64,
    pub subject_attr: i64,
    pub triple: Triple,
}

impl EntityDb {
    pub fn open(db_path: impl AsRef<Path>, ctx: Arc<JsonLdContext>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create data dir: {}", parent.display()))?;
        }
        let conn = Connection::open(&path).with_context(|| format!("open db: {}", path.display()))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS attributes (
              attribute_id INTEGER PRIMARY KEY AUTOINCREMENT,
              uri TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS entities (
              entity_id INTEGER PRIMARY KEY AUTOINCREMENT,
              id_attr INTEGER NOT NULL UNIQUE REFERENCES attributes(attribute_id),
              type TEXT NOT NULL,
              updated_at_ms INTEGER NOT NULL,
              is_owner INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS triples (
              triple_id INTEGER PRIMARY KEY AUTOINCREMENT,
              subject_entity INTEGER NOT NULL REFERENCES entities(entity_id),
              subject_attr INTEGER NOT NULL,
              predicate_attr INTEGER NOT NULL,
              object_attr INTEGER NULL,
              literal TEXT NULL,
              literal_type_attr INTEGER NULL,
              CHECK ((object_attr IS NULL) <> (literal IS NULL))
            );
            CREATE INDEX IF NOT EXISTS idx_triples_subject_pred ON triples(subject_entity, predicate_attr);
            CREATE INDEX IF NOT EXISTS idx_triples_object ON triples(object_attr);

            CREATE TABLE IF NOT EXISTS collection_items (
              item_id INTEGER PRIMARY KEY AUTOINCREMENT,
              collection_entity INTEGER NOT NULL REFERENCES entities(entity_id),
              element_attr INTEGER NOT NULL REFERENCES attributes(attribute_id),
              is_public INTEGER NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_collection_member ON collection_items(collection_entity, element_attr);
            "#,
        )?;
        crate::job_queue::init_schema(&conn)?;
        Ok(Self { path, ctx })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn context(&self) -> &JsonLdContext {
        &self.ctx
    }

    pub fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("open db: {}", self.path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    pub fn health_check(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    /// Assembles the flattened entity stored under `id`.
    pub fn read_entity(&self, conn: &Connection, id: &str) -> Result<Option<APEntity>> {
        let Some(attr) = lookup_attribute(conn, id)? else {
            return Ok(None);
        };
        let Some(row) = get_entity(conn, attr)? else {
            return Ok(None);
        };

        let mut stmt = conn.prepare_cached(
            r#"
            SELECT p.uri, o.uri, t.literal, lt.uri
            FROM triples t
            JOIN attributes p ON p.attribute_id = t.predicate_attr
            LEFT JOIN attributes o ON o.attribute_id = t.object_attr
            LEFT JOIN attributes lt ON lt.attribute_id = t.literal_type_attr
            WHERE t.subject_entity = ?1
            ORDER BY t.triple_id ASC
            "#,
        )?;
        let mut rows = stmt.query(params![row.entity_id])?;
        let mut data = ASObject::with_id(id);
        while let Some(r) = rows.next()? {
            let predicate: String = r.get(0)?;
            let object: Option<String> = r.get(1)?;
            let literal: Option<String> = r.get(2)?;
            let literal_type: Option<String> = r.get(3)?;
            if predicate == RDF_TYPE {
                if let Some(t) = object {
                    data.types.push(self.ctx.compact_iri(&t));
                }
                continue;
            }
            let term = match (object, literal) {
                (Some(o), _) => ASTerm::Ref(o),
                (None, Some(l)) => ASTerm::Literal(self.decode_literal(l, literal_type.as_deref())),
                (None, None) => continue,
            };
            data.add(&self.ctx.compact_iri(&predicate), term);
        }

        Ok(Some(APEntity {
            id: id.to_string(),
            data,
            type_name: row.type_name,
            updated_ms: row.updated_ms,
            is_owner: row.is_owner,
        }))
    }

    /// Upserts the entity row and replaces all of its triples.
    pub fn write_entity(&self, conn: &Connection, entity: &APEntity) -> Result<i64> {
        let id_attr = intern(conn, &entity.id)?;
        let entity_id = upsert_entity(
            conn,
            id_attr,
            &entity.type_name,
            entity.updated_ms,
            entity.is_owner,
        )?;

        let mut triples = Vec::new();
        let rdf_type = intern(conn, RDF_TYPE)?;
        for t in &entity.data.types {
            triples.push(Triple {
                predicate: rdf_type,
                object: TripleObject::Ref(intern(conn, &self.ctx.expand_term(t))?),
            });
        }
        for (pred, terms) in entity.data.props() {
            let predicate = intern(conn, &self.ctx.expand_term(pred))?;
            for term in terms {
                let object = match term {
                    ASTerm::Ref(id) => TripleObject::Ref(intern(conn, id)?),
                    ASTerm::Object(o) => {
                        let id = o
                            .id
                            .as_deref()
                            .ok_or_else(|| anyhow!("unflattened blank node under {pred} of {}", entity.id))?;
                        TripleObject::Ref(intern(conn, id)?)
                    }
                    ASTerm::Literal(l) => {
                        let (value, ty) = self.encode_literal(l);
                        TripleObject::Literal {
                            value,
                            type_attr: intern(conn, &ty)?,
                        }
                    }
                };
                triples.push(Triple { predicate, object });
            }
        }
        put_triples(conn, entity_id, id_attr, &triples)?;
        Ok(entity_id)
    }

    fn encode_literal(&self, l: &Literal) -> (String, String) {
        let explicit = l.datatype.as_deref().map(|d| self.ctx.expand_term(d));
        match &l.value {
            Value::String(s) => (s.clone(), explicit.unwrap_or_else(|| self.ctx.xsd("string"))),
            Value::Bool(b) => (b.to_string(), explicit.unwrap_or_else(|| self.ctx.xsd("boolean"))),
            Value::Number(n) if n.is_i64() || n.is_u64() => {
                (n.to_string(), explicit.unwrap_or_else(|| self.ctx.xsd("integer")))
            }
            Value::Number(n) => (n.to_string(), explicit.unwrap_or_else(|| self.ctx.xsd("double"))),
            other => (other.to_string(), format!("{FG}json")),
        }
    }

    fn decode_literal(&self, raw: String, ty: Option<&str>) -> Literal {
        let plain = |value: Value| Literal { value, datatype: None };
        match ty {
            None => plain(Value::String(raw)),
            Some(t) if t == format!("{XSD}string") => plain(Value::String(raw)),
            Some(t) if t == format!("{XSD}boolean") => plain(Value::Bool(raw == "true")),
            Some(t) if t == format!("{XSD}integer") => match raw.parse::<i64>() {
                Ok(n) => plain(Value::from(n)),
                Err(_) => plain(Value::String(raw)),
            },
            Some(t) if t == format!("{XSD}double") => match raw.parse::<f64>() {
                Ok(n) => plain(Value::from(n)),
                Err(_) => plain(Value::String(raw)),
            },
            Some(t) if t == format!("{FG}json") => {
                plain(serde_json::from_str(&raw).unwrap_or(Value::String(raw)))
            }
            Some(t) => Literal {
                value: Value::String(raw),
                datatype: Some(self.ctx.compact_iri(t)),
            },
        }
    }
}

/// Returns the attribute id for `uri`, creating it on first use.
pub fn intern(conn: &Connection, uri: &str) -> Result<i64> {
    conn.execute(
        "INSERT OR IGNORE INTO attributes(uri) VALUES (?1)",
        params![uri],
    )?;
    let id = conn.query_row(
        "SELECT attribute_id FROM attributes WHERE uri=?1",
        params![uri],
        |r| r.get(0),
    )?;
    Ok(id)
}

pub fn lookup_attribute(conn: &Connection, uri: &str) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT attribute_id FROM attributes WHERE uri=?1",
        params![uri],
        |r| r.get(0),
    )
    .optional()
    .map_err(Into::into)
}

pub fn attribute_uri(conn: &Connection, attribute_id: i64) -> Result<Option<String>> {
    conn.query_row(
        "SELECT uri FROM attributes WHERE attribute_id=?1",
        params![attribute_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(Into::into)
}

pub fn get_entity(conn: &Connection, id_attr: i64) -> Result<Option<EntityRow>> {
    conn.query_row(
        "SELECT entity_id, id_attr, type, updated_at_ms, is_owner FROM entities WHERE id_attr=?1",
        params![id_attr],
        |r| {
            Ok(EntityRow {
                entity_id: r.get(0)?,
                id_attr: r.get(1)?,
                type_name: r.get(2)?,
                updated_ms: r.get(3)?,
                is_owner: r.get::<_, i64>(4)? != 0,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

pub fn upsert_entity(
    conn: &Connection,
    id_attr: i64,
    type_name: &str,
    updated_ms: i64,
    is_owner: bool,
) -> Result<i64> {
    conn.execute(
        r#"
        INSERT INTO entities(id_attr, type, updated_at_ms, is_owner)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(id_attr) DO UPDATE SET
          type=excluded.type,
          updated_at_ms=excluded.updated_at_ms,
          is_owner=excluded.is_owner
        "#,
        params![id_attr, type_name, updated_ms, is_owner as i64],
    )?;
    let id = conn.query_row(
        "SELECT entity_id FROM entities WHERE id_attr=?1",
        params![id_attr],
        |r| r.get(0),
    )?;
    Ok(id)
}

/// Replaces every triple of `entity_id`. Atomicity comes from the caller's transaction.
pub fn put_triples(conn: &Connection, entity_id: i64, subject_attr: i64, triples: &[Triple]) -> Result<()> {
    conn.execute(
        "DELETE FROM triples WHERE subject_entity=?1",
        params![entity_id],
    )?;
    let mut stmt = conn.prepare_cached(
        r#"
        INSERT INTO triples(subject_entity, subject_attr, predicate_attr, object_attr, literal, literal_type_attr)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )?;
    for t in triples {
        match &t.object {
            TripleObject::Ref(o) => {
                stmt.execute(params![entity_id, subject_attr, t.predicate, o, None::<String>, None::<i64>])?
            }
            TripleObject::Literal { value, type_attr } => {
                stmt.execute(params![entity_id, subject_attr, t.predicate, None::<i64>, value, type_attr])?
            }
        };
    }
    Ok(())
}

pub fn query_by_subject_and_predicate(
    conn: &Connection,
    subject_entity: i64,
    predicate: i64,
) -> Result<Vec<TripleRow>> {
    let mut stmt = conn.prepare_cached(
        r#"
        SELECT triple_id, subject_entity, subject_attr, predicate_attr, object_attr, literal, literal_type_attr
        FROM triples
        WHERE subject_entity=?1 AND predicate_attr=?2
        ORDER BY triple_id ASC
        "#,
    )?;
    let rows = collect_rows(stmt.query(params![subject_entity, predicate])?);
    rows
}

pub fn query_by_subject(conn: &Connection, subject_entity: i64) -> Result<Vec<TripleRow>> {
    let mut stmt = conn.prepare_cached(
        r#"
        SELECT triple_id, subject_entity, subject_attr, predicate_attr, object_attr, literal, literal_type_attr
        FROM triples
        WHERE subject_entity=?1
        ORDER BY triple_id ASC
        "#,
    )?;
    let rows = collect_rows(stmt.query(params![subject_entity])?);
    rows
}

fn collect_rows(mut rows: rusqlite::Rows<'_>) -> Result<Vec<TripleRow>> {
    let mut out = Vec::new();
    while let Some(r) = rows.next()? {
        let object_attr: Option<i64> = r.get(4)?;
        let literal: Option<String> = r.get(5)?;
        let literal_type: Option<i64> = r.get(6)?;
        let object = match (object_attr, literal) {
            (Some(o), None) => TripleObject::Ref(o),
            (None, Some(value)) => TripleObject::Literal {
                value,
                type_attr: literal_type.unwrap_or_default(),
            },
            _ => return Err(anyhow!("triple {} violates the ref/literal invariant", r.get::<_, i64>(0)?)),
        };
        out.push(TripleRow {
            triple_id: r.get(0)?,
            subject_entity: r.get(1)?,
            subject_attr: r.get(2)?,
            triple: Triple {
                predicate: r.get(3)?,
                object,
            },
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn open_tmp() -> (tempfile::TempDir, EntityDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = EntityDb::open(dir.path().join("t.db"), Arc::new(JsonLdContext::default())).unwrap();
        (dir, db)
    }

    #[test]
    fn intern_is_idempotent() {
        let (_dir, db) = open_tmp();
        let conn = db.connect().unwrap();
        let a = intern(&conn, "https://a.example/x").unwrap();
        let b = intern(&conn, "https://a.example/x").unwrap();
        let c = intern(&conn, "https://a.example/y").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(attribute_uri(&conn, c).unwrap().as_deref(), Some("https://a.example/y"));
    }

    #[test]
    fn put_triples_replaces_previous_set() {
        let (_dir, db) = open_tmp();
        let conn = db.connect().unwrap();
        let subj = intern(&conn, "https://a.example/s").unwrap();
        let pred = intern(&conn, "https://a.example/p").unwrap();
        let o1 = intern(&conn, "https://a.example/o1").unwrap();
        let o2 = intern(&conn, "https://a.example/o2").unwrap();
        let ty = intern(&conn, &format!("{XSD}string")).unwrap();
        let eid = upsert_entity(&conn, subj, "Note", 1, true).unwrap();

        put_triples(&conn, eid, subj, &[
            Triple { predicate: pred, object: TripleObject::Ref(o1) },
            Triple { predicate: pred, object: TripleObject::Ref(o2) },
        ])
        .unwrap();
        assert_eq!(query_by_subject_and_predicate(&conn, eid, pred).unwrap().len(), 2);

        put_triples(&conn, eid, subj, &[Triple {
            predicate: pred,
            object: TripleObject::Literal { value: "x".into(), type_attr: ty },
        }])
        .unwrap();
        let rows = query_by_subject(&conn, eid).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(matches!(rows[0].triple.object, TripleObject::Literal { .. }));
    }

    #[test]
    fn entity_round_trips_through_triples() {
        let (_dir, db) = open_tmp();
        let conn = db.connect().unwrap();
        let data = ASObject::from_json(
            db.context(),
            &json!({
                "id": "https://a.example/notes/1",
                "type": "Note",
                "content": "hi",
                "sensitive": false,
                "to": ["https://b.example/u1", "https://b.example/u2"],
                "published": {"@value": "2026-01-01T00:00:00Z", "@type": "xsd:dateTime"}
            }),
        )
        .unwrap();
        let entity = APEntity::new(data.clone(), true).unwrap();
        db.write_entity(&conn, &entity).unwrap();

        let back = db.read_entity(&conn, "https://a.example/notes/1").unwrap().unwrap();
        assert_eq!(back.data, data);
        assert_eq!(back.type_name, "Note");
        assert!(back.is_owner);
        assert!(db.read_entity(&conn, "https://a.example/missing").unwrap().is_none());
    }
}
