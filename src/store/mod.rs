//! Durable session store.
//!
//! An in-memory map of session id to session record, persisted as one YAML
//! document after every mutation. Persistence writes a temp file in the same
//! directory, fsyncs, then renames over the store; a crash never leaves a
//! partially-written file. At startup every record is probed against the
//! container runtime and records whose container is definitely gone are
//! dropped.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::core::{Error, Result, Session};
use crate::runtime::ContainerRuntime;

/// YAML-backed map of live sessions.
pub struct SessionStore {
    db_path: PathBuf,
    sessions: RwLock<HashMap<Uuid, Session>>,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("db_path", &self.db_path)
            .finish_non_exhaustive()
    }
}

impl SessionStore {
    /// Build a store persisting to the given YAML file.
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self {
            db_path,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Load the store and drop records whose container no longer exists.
    ///
    /// A probe error leaves the record in place: only a definite "missing"
    /// from the runtime marks a session stale. The pruned map is saved back
    /// atomically.
    ///
    /// # Errors
    /// Returns an error when the store file exists but cannot be parsed, or
    /// when the pruned map cannot be persisted.
    pub async fn load_and_reconcile(&self, runtime: &Arc<dyn ContainerRuntime>) -> Result<()> {
        let loaded: HashMap<Uuid, Session> = if self.db_path.exists() {
            let content = std::fs::read_to_string(&self.db_path)?;
            if content.trim().is_empty() {
                HashMap::new()
            } else {
                serde_yaml::from_str(&content)
                    .map_err(|e| Error::Internal(anyhow::anyhow!("corrupt session store: {e}")))?
            }
        } else {
            HashMap::new()
        };

        let mut live = HashMap::new();
        for (id, session) in loaded {
            match runtime.exists(&session.instance_id).await {
                Ok(true) => {
                    live.insert(id, session);
                }
                Ok(false) => {
                    tracing::warn!(
                        session = %id,
                        instance = %session.instance_id,
                        "dropping stale session, container is gone"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        session = %id,
                        error = %e,
                        "could not probe container at startup, keeping session"
                    );
                    live.insert(id, session);
                }
            }
        }

        let mut sessions = self.sessions.write().await;
        *sessions = live;
        Self::persist_locked(&self.db_path, &sessions)?;
        tracing::info!(count = sessions.len(), "session store loaded");
        Ok(())
    }

    fn persist_locked(db_path: &PathBuf, sessions: &HashMap<Uuid, Session>) -> Result<()> {
        let yaml = serde_yaml::to_string(sessions)
            .map_err(|e| Error::Internal(anyhow::anyhow!("session store encode failed: {e}")))?;

        let parent = db_path
            .parent()
            .ok_or_else(|| Error::Internal(anyhow::anyhow!("session store path has no parent")))?;
        std::fs::create_dir_all(parent)?;

        let mut temp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| Error::Internal(anyhow::anyhow!("temp file creation failed: {e}")))?;
        temp.write_all(yaml.as_bytes())?;
        temp.as_file().sync_all()?;
        temp.persist(db_path)
            .map_err(|e| Error::Internal(anyhow::anyhow!("session store rename failed: {e}")))?;
        Ok(())
    }

    /// Insert or replace a session and persist.
    ///
    /// # Errors
    /// Returns an error when persistence fails.
    pub async fn insert(&self, session: Session) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.session_id, session);
        Self::persist_locked(&self.db_path, &sessions)
    }

    /// Remove a session and persist, returning the removed record.
    ///
    /// # Errors
    /// Returns an error when persistence fails.
    pub async fn remove(&self, session_id: Uuid) -> Result<Option<Session>> {
        let mut sessions = self.sessions.write().await;
        let removed = sessions.remove(&session_id);
        if removed.is_some() {
            Self::persist_locked(&self.db_path, &sessions)?;
        }
        Ok(removed)
    }

    /// Mutate a session in place and persist; no-op for unknown sessions.
    ///
    /// Returns the updated record.
    ///
    /// # Errors
    /// Returns an error when persistence fails.
    pub async fn update<F>(&self, session_id: Uuid, mutate: F) -> Result<Option<Session>>
    where
        F: FnOnce(&mut Session),
    {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(&session_id) else {
            return Ok(None);
        };
        mutate(session);
        let updated = session.clone();
        Self::persist_locked(&self.db_path, &sessions)?;
        Ok(Some(updated))
    }

    /// Get a session by id.
    pub async fn get(&self, session_id: Uuid) -> Option<Session> {
        self.sessions.read().await.get(&session_id).cloned()
    }

    /// All sessions.
    pub async fn list(&self) -> Vec<Session> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Sessions owned by one user, newest first.
    pub async fn list_for_user(&self, username: &str) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.username == username)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sessions
    }

    /// Number of stored sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MockRuntime;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn sample(instance_id: &str, username: &str) -> Session {
        Session {
            session_id: Uuid::new_v4(),
            access_token: "tok".to_owned(),
            instance_id: instance_id.to_owned(),
            ip: "172.17.0.2".to_owned(),
            port: 3000,
            created_at: Utc::now(),
            provider_app_id: "app".to_owned(),
            username: username.to_owned(),
            app_name: "Firefox".to_owned(),
            app_logo: "logo".to_owned(),
            host_mount_path: None,
            launch_context: None,
            custom_user: "u".to_owned(),
            password: "p".to_owned(),
            is_collaboration: false,
            master_token: None,
            controller_token: None,
            participant_invite_token: None,
            readonly_invite_token: None,
            viewers: Vec::new(),
            controller_slot: None,
            mk_owner_token: None,
            designated_speaker: None,
            container_registry: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn persists_after_every_mutation() {
        let tmp = TempDir::new().unwrap();
        let db = tmp.path().join("sessions.yml");
        let store = SessionStore::new(db.clone());

        let session = sample("c1", "alice");
        let id = session.session_id;
        store.insert(session).await.unwrap();
        assert!(db.exists());

        let on_disk: HashMap<Uuid, Session> =
            serde_yaml::from_str(&std::fs::read_to_string(&db).unwrap()).unwrap();
        assert_eq!(on_disk.len(), 1);
        assert!(on_disk.contains_key(&id));

        store.remove(id).await.unwrap();
        let on_disk: HashMap<Uuid, Session> =
            serde_yaml::from_str(&std::fs::read_to_string(&db).unwrap()).unwrap();
        assert!(on_disk.is_empty());
    }

    #[tokio::test]
    async fn reconcile_drops_only_definitely_dead_sessions() {
        let tmp = TempDir::new().unwrap();
        let db = tmp.path().join("sessions.yml");

        let alive = sample("c-alive", "alice");
        let dead = sample("c-dead", "bob");
        let alive_id = alive.session_id;
        let mut map = HashMap::new();
        map.insert(alive.session_id, alive);
        map.insert(dead.session_id, dead);
        std::fs::write(&db, serde_yaml::to_string(&map).unwrap()).unwrap();

        let mock = Arc::new(MockRuntime::new());
        mock.add_container("c-alive").await;
        let runtime: Arc<dyn ContainerRuntime> = mock;

        let store = SessionStore::new(db.clone());
        store.load_and_reconcile(&runtime).await.unwrap();

        assert_eq!(store.len().await, 1);
        assert!(store.get(alive_id).await.is_some());

        // The pruned map was rewritten
        let on_disk: HashMap<Uuid, Session> =
            serde_yaml::from_str(&std::fs::read_to_string(&db).unwrap()).unwrap();
        assert_eq!(on_disk.len(), 1);
    }

    #[tokio::test]
    async fn reconcile_keeps_sessions_on_probe_errors() {
        let tmp = TempDir::new().unwrap();
        let db = tmp.path().join("sessions.yml");
        let session = sample("c1", "alice");
        let mut map = HashMap::new();
        map.insert(session.session_id, session);
        std::fs::write(&db, serde_yaml::to_string(&map).unwrap()).unwrap();

        let mock = Arc::new(MockRuntime::new());
        mock.set_fail_exists(true);
        let runtime: Arc<dyn ContainerRuntime> = mock;

        let store = SessionStore::new(db);
        store.load_and_reconcile(&runtime).await.unwrap();
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path().join("sessions.yml"));
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(MockRuntime::new());
        store.load_and_reconcile(&runtime).await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn update_mutates_and_persists() {
        let tmp = TempDir::new().unwrap();
        let db = tmp.path().join("sessions.yml");
        let store = SessionStore::new(db.clone());
        let session = sample("c1", "alice");
        let id = session.session_id;
        store.insert(session).await.unwrap();

        let updated = store
            .update(id, |s| s.designated_speaker = Some("tok-x".to_owned()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.designated_speaker.as_deref(), Some("tok-x"));

        let on_disk: HashMap<Uuid, Session> =
            serde_yaml::from_str(&std::fs::read_to_string(&db).unwrap()).unwrap();
        assert_eq!(
            on_disk.get(&id).unwrap().designated_speaker.as_deref(),
            Some("tok-x")
        );

        assert!(store.update(Uuid::new_v4(), |_| {}).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn per_user_listing_is_newest_first() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path().join("sessions.yml"));
        let mut older = sample("c1", "alice");
        older.created_at = Utc::now() - chrono::Duration::minutes(5);
        let newer = sample("c2", "alice");
        let other = sample("c3", "bob");
        store.insert(older.clone()).await.unwrap();
        store.insert(newer.clone()).await.unwrap();
        store.insert(other).await.unwrap();

        let sessions = store.list_for_user("alice").await;
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].session_id, newer.session_id);
        assert_eq!(sessions[1].session_id, older.session_id);
    }
}
