/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use rand::rngs::OsRng;
use rsa::{
    pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding},
    RsaPrivateKey, RsaPublicKey,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

/// Per-actor signing key.
#[derive(Clone)]
pub struct ActorKey {
    pub actor_id: String,
    pub key_id: String,
    pub private_key_pem: String,
    pub public_key_pem: String,
}

/// Signing keys of locally owned actors, kept next to the triple store.
#[derive(Clone)]
pub struct KeyStore {
    db_path: PathBuf,
    key_bits: usize,
}

impl KeyStore {
    pub fn open(db_path: impl AsRef<Path>, key_bits: usize) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        let conn = Connection::open(&db_path)
            .with_context(|| format!("open db: {}", db_path.display()))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS actor_keys (
              actor_id TEXT PRIMARY KEY,
              private_key_pem TEXT NOT NULL,
              public_key_pem TEXT NOT NULL,
              created_at_ms INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(Self { db_path, key_bits })
    }

    pub async fn get(&self, actor_id: &str) -> Result<Option<ActorKey>> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            let actor_id = actor_id.to_string();
            move || -> Result<Option<ActorKey>> {
                let conn = Connection::open(db_path)?;
                let row: Option<(String, String)> = conn
                    .query_row(
                        "SELECT private_key_pem, public_key_pem FROM actor_keys WHERE actor_id=?1",
                        params![actor_id],
                        |r| Ok((r.get(0)?, r.get(1)?)),
                    )
                    .optional()?;
                Ok(row.map(|(private_key_pem, public_key_pem)| ActorKey {
                    key_id: key_id_for(&actor_id),
                    actor_id,
                    private_key_pem,
                    public_key_pem,
                }))
            }
        })
        .await?
    }

    /// Returns the actor's key, generating and persisting one on first use.
    pub async fn get_or_create(&self, actor_id: &str) -> Result<ActorKey> {
        if let Some(k) = self.get(actor_id).await? {
            return Ok(k);
        }
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            let actor_id = actor_id.to_string();
            let bits = self.key_bits;
            move || -> Result<ActorKey> {
                let (private_key_pem, public_key_pem) = generate_key_pair(bits)?;
                let conn = Connection::open(db_path)?;
                conn.busy_timeout(std::time::Duration::from_secs(5))?;
                conn.execute(
                    r#"
                    INSERT OR IGNORE INTO actor_keys(actor_id, private_key_pem, public_key_pem, created_at_ms)
                    VALUES (?1, ?2, ?3, ?4)
                    "#,
                    params![actor_id, private_key_pem, public_key_pem, crate::object::now_ms()],
                )?;
                // A concurrent creator may have won; the stored row is authoritative.
                let (private_key_pem, public_key_pem): (String, String) = conn.query_row(
                    "SELECT private_key_pem, public_key_pem FROM actor_keys WHERE actor_id=?1",
                    params![actor_id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )?;
                Ok(ActorKey {
                    key_id: key_id_for(&actor_id),
                    actor_id,
                    private_key_pem,
                    public_key_pem,
                })
            }
        })
        .await?
    }
}

pub fn key_id_for(actor_id: &str) -> String {
    format!("{actor_id}#key")
}

/// PKCS#8 private / SPKI public PEM pair.
pub fn generate_key_pair(bits: usize) -> Result<(String, String)> {
    let mut rng = OsRng;
    let private_key = RsaPrivateKey::new(&mut rng, bits)?;
    let private_pem = private_key.to_pkcs8_pem(LineEnding::LF)?.to_string();
    let public_pem = public_key_pem(&private_pem)?;
    Ok((private_pem, public_pem))
}

pub fn public_key_pem(private_key_pem: &str) -> Result<String> {
    let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
        .context("parse private key pem")?;
    let public_key = RsaPublicKey::from(&private_key);
    Ok(public_key.to_public_key_pem(LineEnding::LF)?.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn key_is_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let keys = KeyStore::open(dir.path().join("k.db"), 1024).unwrap();
        let a = keys.get_or_create("https://a.example/users/alice").await.unwrap();
        let b = keys.get_or_create("https://a.example/users/alice").await.unwrap();
        assert_eq!(a.private_key_pem, b.private_key_pem);
        assert_eq!(a.key_id, "https://a.example/users/alice#key");
        assert_eq!(public_key_pem(&a.private_key_pem).unwrap(), a.public_key_pem);
        assert!(keys.get("https://a.example/users/bob").await.unwrap().is_none());
    }
}
