//! Durable registry of AI-created servers.
//!
//! The manifest is a JSON object keyed by server id. Every mutation rewrites
//! the whole file through [`crate::fsio::write_atomic`], so a crash mid-write
//! leaves either the previous or the new file on disk. Source text is not
//! stored here; it lives in each instance's entry point.

use crate::fsio;
use chrono::{DateTime, Utc};
use kiln_shared::{Capabilities, KilnError, KilnResult, ServerDefinition, ValidationStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub autostart: bool,
    pub validation_status: ValidationStatus,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub last_validated_at: DateTime<Utc>,
}

impl ManifestEntry {
    #[must_use]
    pub fn from_definition(def: &ServerDefinition) -> Self {
        Self {
            name: def.id.clone(),
            description: def.description.clone(),
            capabilities: def.capabilities,
            autostart: def.autostart,
            validation_status: def.validation.clone(),
            created_at: def.created_at,
            modified_at: def.modified_at,
            last_validated_at: def.last_validated_at,
        }
    }

    #[must_use]
    pub fn into_definition(self, source: String) -> ServerDefinition {
        ServerDefinition {
            id: self.name,
            description: self.description,
            source,
            capabilities: self.capabilities,
            autostart: self.autostart,
            created_at: self.created_at,
            modified_at: self.modified_at,
            last_validated_at: self.last_validated_at,
            validation: self.validation_status,
        }
    }
}

pub struct ManifestStore {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, ManifestEntry>>,
}

impl ManifestStore {
    /// Load the manifest at `path`. A missing file is an empty manifest; an
    /// unreadable or unparseable one is moved aside and replaced by an empty
    /// manifest so startup can continue.
    #[must_use]
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match read_manifest(&path) {
            Ok(entries) => {
                if !entries.is_empty() {
                    info!("📜 Loaded {} server(s) from {}", entries.len(), path.display());
                }
                entries
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Manifest unusable, starting with an empty one");
                quarantine(&path);
                BTreeMap::new()
            }
        };
        Self {
            path,
            entries: RwLock::new(entries),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, id: &str) -> Option<ManifestEntry> {
        self.entries.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.entries.read().await.contains_key(id)
    }

    /// All entries in id order.
    pub async fn list(&self) -> Vec<ManifestEntry> {
        self.entries.read().await.values().cloned().collect()
    }

    pub async fn autostart_ids(&self) -> Vec<String> {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.autostart)
            .map(|e| e.name.clone())
            .collect()
    }

    /// Add a new entry; fails if the id is taken.
    pub async fn insert(&self, entry: ManifestEntry) -> KilnResult<()> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&entry.name) {
            return Err(KilnError::AlreadyExists(entry.name));
        }
        let mut next = entries.clone();
        next.insert(entry.name.clone(), entry);
        self.persist(&next)?;
        *entries = next;
        Ok(())
    }

    /// Insert or replace an entry.
    pub async fn upsert(&self, entry: ManifestEntry) -> KilnResult<()> {
        let mut entries = self.entries.write().await;
        let mut next = entries.clone();
        next.insert(entry.name.clone(), entry);
        self.persist(&next)?;
        *entries = next;
        Ok(())
    }

    /// Apply `f` to an existing entry and persist the result.
    pub async fn update<F>(&self, id: &str, f: F) -> KilnResult<ManifestEntry>
    where
        F: FnOnce(&mut ManifestEntry),
    {
        let mut entries = self.entries.write().await;
        let mut next = entries.clone();
        let entry = next
            .get_mut(id)
            .ok_or_else(|| KilnError::ServerNotFound(id.to_string()))?;
        f(entry);
        let updated = entry.clone();
        self.persist(&next)?;
        *entries = next;
        Ok(updated)
    }

    pub async fn remove(&self, id: &str) -> KilnResult<ManifestEntry> {
        let mut entries = self.entries.write().await;
        let mut next = entries.clone();
        let removed = next
            .remove(id)
            .ok_or_else(|| KilnError::ServerNotFound(id.to_string()))?;
        self.persist(&next)?;
        *entries = next;
        Ok(removed)
    }

    fn persist(&self, entries: &BTreeMap<String, ManifestEntry>) -> KilnResult<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_vec_pretty(entries)
            .map_err(|e| KilnError::Internal(format!("Failed to serialize manifest: {e}")))?;
        fsio::write_atomic(&self.path, &json).map_err(|e| {
            error!(path = %self.path.display(), error = %e, "Failed to write manifest");
            KilnError::Io(format!("Failed to write manifest: {e}"))
        })
    }
}

fn read_manifest(path: &Path) -> KilnResult<BTreeMap<String, ManifestEntry>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(KilnError::ManifestCorruption(e.to_string())),
    };
    let mut entries: BTreeMap<String, ManifestEntry> = serde_json::from_slice(&bytes)
        .map_err(|e| KilnError::ManifestCorruption(e.to_string()))?;
    for (key, entry) in &mut entries {
        if entry.name != *key {
            warn!(key = %key, name = %entry.name, "Manifest entry name differs from its key, using the key");
            entry.name.clone_from(key);
        }
    }
    Ok(entries)
}

/// Move an unusable manifest out of the way so the next write cannot clobber it.
fn quarantine(path: &Path) {
    if !path.exists() {
        return;
    }
    let stamp = Utc::now().format("%Y%m%dT%H%M%S");
    let mut aside = path.as_os_str().to_owned();
    aside.push(format!(".corrupt-{stamp}"));
    match std::fs::rename(path, &aside) {
        Ok(()) => warn!(backup = %Path::new(&aside).display(), "Corrupt manifest moved aside"),
        Err(e) => error!(error = %e, "Failed to move corrupt manifest aside"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_shared::ValidationResult;

    fn entry(name: &str, autostart: bool) -> ManifestEntry {
        let now = Utc::now();
        ManifestEntry {
            name: name.to_string(),
            description: format!("{name} server"),
            capabilities: Capabilities::none(),
            autostart,
            validation_status: ValidationResult::Valid.to_status(now),
            created_at: now,
            modified_at: now,
            last_validated_at: now,
        }
    }

    #[tokio::test]
    async fn test_roundtrip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let store = ManifestStore::load(&path);
        store.insert(entry("beta", false)).await.unwrap();
        store.insert(entry("alpha", true)).await.unwrap();

        let reloaded = ManifestStore::load(&path);
        let names: Vec<String> = reloaded.list().await.into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
        assert_eq!(reloaded.autostart_ids().await, vec!["alpha"]);
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::load(dir.path().join("manifest.json"));
        store.insert(entry("calc", false)).await.unwrap();
        let err = store.insert(entry("calc", true)).await.unwrap_err();
        assert!(matches!(err, KilnError::AlreadyExists(_)));
        assert!(!store.get("calc").await.unwrap().autostart);
    }

    #[tokio::test]
    async fn test_update_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let store = ManifestStore::load(&path);
        store.insert(entry("calc", false)).await.unwrap();

        let updated = store.update("calc", |e| e.autostart = true).await.unwrap();
        assert!(updated.autostart);
        assert!(ManifestStore::load(&path).get("calc").await.unwrap().autostart);

        store.remove("calc").await.unwrap();
        assert!(!store.contains("calc").await);
        assert!(matches!(
            store.remove("calc").await.unwrap_err(),
            KilnError::ServerNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_corrupt_manifest_falls_back_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(&path, "{\"calc\": {\"name\": ").unwrap();

        let store = ManifestStore::load(&path);
        assert!(store.list().await.is_empty());
        assert!(!path.exists());
        let backups = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().contains(".corrupt-"))
            .count();
        assert_eq!(backups, 1);

        store.insert(entry("calc", false)).await.unwrap();
        assert!(ManifestStore::load(&path).contains("calc").await);
    }

    #[tokio::test]
    async fn test_definition_conversion_keeps_metadata() {
        let e = entry("calc", true);
        let def = e.clone().into_definition("import json\n".to_string());
        assert_eq!(def.id, "calc");
        assert!(def.is_runnable());
        assert_eq!(ManifestEntry::from_definition(&def), e);
    }
}
