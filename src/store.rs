//! Durable chute state store.
//!
//! One JSON file per chute under the configured storage directory,
//! mirrored in memory.  The lock guards only map access, never an
//! in-flight container operation; write serialization per chute is
//! the update executor's job.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use log::{info, warn};
use tokio::fs;
use tokio::sync::RwLock;

use crate::errors::ChuteError;
use crate::types::Chute;

pub struct ChuteStore {
    dir: PathBuf,
    chutes: RwLock<HashMap<String, Chute>>,
}

impl ChuteStore {
    /// Open the store, creating the directory if needed and loading
    /// every readable record.  Unreadable records are skipped with a
    /// warning rather than aborting startup.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, ChuteError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;

        let mut chutes = HashMap::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<Chute>(&bytes) {
                    Ok(chute) => {
                        chutes.insert(chute.name.clone(), chute);
                    }
                    Err(e) => warn!("skipping unreadable chute record {}: {}", path.display(), e),
                },
                Err(e) => warn!("skipping chute record {}: {}", path.display(), e),
            }
        }
        info!("loaded {} chute record(s) from {}", chutes.len(), dir.display());

        Ok(Self {
            dir,
            chutes: RwLock::new(chutes),
        })
    }

    pub async fn get(&self, name: &str) -> Option<Chute> {
        self.chutes.read().await.get(name).cloned()
    }

    pub async fn list(&self) -> Vec<Chute> {
        self.chutes.read().await.values().cloned().collect()
    }

    /// Upsert a chute record.  The file is written to a temp path and
    /// renamed so a crash mid-write cannot truncate an existing record.
    pub async fn put(&self, chute: &Chute) -> Result<(), ChuteError> {
        let bytes = serde_json::to_vec_pretty(chute)?;
        let path = self.record_path(&chute.name);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, &path).await?;
        self.chutes
            .write()
            .await
            .insert(chute.name.clone(), chute.clone());
        Ok(())
    }

    /// Delete a chute record.  Missing files are tolerated so delete
    /// is safe to repeat.
    pub async fn delete(&self, name: &str) -> Result<(), ChuteError> {
        match fs::remove_file(self.record_path(name)).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.chutes.write().await.remove(name);
        Ok(())
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChuteConfig, ChuteState, HostConfigOptions};

    fn chute(name: &str) -> Chute {
        Chute::new(
            name.to_string(),
            ChuteConfig {
                dockerfile: "FROM alpine".into(),
                host_config: HostConfigOptions::default(),
                net: vec![],
            },
        )
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = ChuteStore::open(dir.path()).await.unwrap();
            let mut ch = chute("app1");
            ch.state = ChuteState::Running;
            ch.warnings.push("one warning".into());
            store.put(&ch).await.unwrap();
            store.put(&chute("app2")).await.unwrap();
        }

        let store = ChuteStore::open(dir.path()).await.unwrap();
        assert_eq!(store.list().await.len(), 2);
        let ch = store.get("app1").await.unwrap();
        assert_eq!(ch.state, ChuteState::Running);
        assert_eq!(ch.warnings, vec!["one warning".to_string()]);
    }

    #[tokio::test]
    async fn delete_removes_record_and_tolerates_repeat() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChuteStore::open(dir.path()).await.unwrap();
        store.put(&chute("app1")).await.unwrap();
        store.delete("app1").await.unwrap();
        assert!(store.get("app1").await.is_none());
        store.delete("app1").await.unwrap();

        let store = ChuteStore::open(dir.path()).await.unwrap();
        assert!(store.get("app1").await.is_none());
    }
}
