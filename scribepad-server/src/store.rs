//! Durable document store keeping one JSON record per document.
//!
//! The production deployment fronts a replicated database; this store keeps
//! the same record shape on the local filesystem, which is all the engine
//! reads. Owner and name indexes are a property of that database and are
//! not reproduced here.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::SystemTime;

use anyhow::{Context, Result, bail};
use rand::random;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::Identifier;
use crate::permissions::Role;

/// A document as persisted in the durable store.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DocumentRecord {
    /// Stable identity across instances.
    pub id: Identifier,
    /// Display name.
    pub name: String,
    /// Serialized canonical content.
    pub data: String,
    /// Identity of the creator.
    pub owner: Identifier,
    /// Granted roles by user id; absence means guest.
    pub permissions: HashMap<Identifier, Role>,
    /// Creation instant.
    pub created_at: SystemTime,
    /// Instant of the last durable write.
    pub updated_at: SystemTime,
}

impl DocumentRecord {
    /// A fresh, empty record owned by `owner`.
    pub fn fresh(id: Identifier, name: &str, owner: Identifier) -> Self {
        let now = SystemTime::now();
        Self {
            id,
            name: name.to_string(),
            data: String::new(),
            owner,
            permissions: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Handle to the on-disk document store.
#[derive(Debug)]
pub struct Store {
    storage: PathBuf,
}

impl Store {
    /// Open the store rooted at `storage`, creating it if necessary.
    pub async fn new(storage: PathBuf) -> Result<Self> {
        let this = Self { storage };
        fs::create_dir_all(this.document_dir())
            .await
            .context("Failed to create document storage")?;
        Ok(this)
    }

    /// Open a store in a temporary directory for testing.
    pub async fn temporary() -> Result<Self> {
        let storage = std::env::temp_dir().join(format!("scribepad_{:x}", random::<u64>()));
        Self::new(storage).await
    }

    /// Path of the directory backing this store.
    pub fn path(&self) -> &PathBuf {
        &self.storage
    }

    /// Load a document record.
    pub async fn load(&self, id: &Identifier) -> Result<DocumentRecord> {
        let path = self.record_path(id);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            bail!("Document not found");
        }
        let raw = fs::read_to_string(&path).await?;
        serde_json::from_str(&raw).context("Failed to parse document record")
    }

    /// Write a document record, replacing any previous version.
    pub async fn store(&self, record: &DocumentRecord) -> Result<()> {
        let path = self.record_path(&record.id);
        let record = record.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            std::fs::write(path, serde_json::to_string_pretty(&record)?)
                .context("Failed to write document record")?;
            Ok(())
        })
        .await??;
        Ok(())
    }

    /// Lightweight existence probe, used to validate cache hits.
    pub async fn exists(&self, id: &Identifier) -> bool {
        fs::try_exists(self.record_path(id)).await.unwrap_or(false)
    }

    /// Remove a document record permanently.
    pub async fn delete(&self, id: &Identifier) -> Result<()> {
        fs::remove_file(self.record_path(id))
            .await
            .context("Failed to delete document record")
    }

    /// Count the number of documents in the store.
    pub async fn document_count(&self) -> Result<usize> {
        let mut entries = fs::read_dir(self.document_dir()).await?;
        let mut count = 0;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file()
                && entry.path().extension().and_then(|s| s.to_str()) == Some("json")
            {
                count += 1;
            }
        }
        Ok(count)
    }

    fn record_path(&self, id: &Identifier) -> PathBuf {
        self.document_dir().join(id.as_ref()).with_extension("json")
    }

    fn document_dir(&self) -> PathBuf {
        self.storage.join("docs")
    }
}

#[cfg(test)]
impl Drop for Store {
    fn drop(&mut self) {
        // Clean up temporary storage directories on drop.
        if self.storage.parent() == Some(std::env::temp_dir().as_path()) {
            let _ = std::fs::remove_dir_all(&self.storage);
        }
    }
}
