pub mod session;

pub use session::{CommandOutput, SessionInfo, TransportSession};

use crate::config::ProfileStore;
use crate::error::{AppError, AppResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Owns every live session and the mapping from session ids to transports.
///
/// Map mutations are lock-protected; the slow network calls (connect, exec,
/// transfer) happen on the session itself, outside any registry-wide lock.
pub struct ConnectionRegistry {
    profiles: Arc<RwLock<ProfileStore>>,
    sessions: DashMap<String, Arc<TransportSession>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new(profiles: Arc<RwLock<ProfileStore>>) -> Self {
        Self {
            profiles,
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Create a new disconnected session for a named profile.
    ///
    /// Ids are caller-supplied or allocated from a monotonic counter and are
    /// never reused while the registry lives. Does not connect.
    pub fn create(&self, profile_name: &str, explicit_id: Option<&str>) -> AppResult<String> {
        let profile = self
            .profiles
            .read()
            .get(profile_name)
            .ok_or_else(|| AppError::ProfileNotFound(profile_name.to_string()))?;

        loop {
            let id = match explicit_id {
                Some(id) => id.to_string(),
                None => format!("conn-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
            };

            match self.sessions.entry(id.clone()) {
                Entry::Occupied(_) if explicit_id.is_some() => {
                    return Err(AppError::Ssh(format!(
                        "session id '{}' is already in use",
                        id
                    )));
                }
                // Auto id collided with an earlier explicit one; allocate again.
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    slot.insert(Arc::new(TransportSession::new(id.clone(), profile.clone())));
                    tracing::info!("Created session {} for profile '{}'", id, profile_name);
                    return Ok(id);
                }
            }
        }
    }

    pub fn get(&self, id: &str) -> AppResult<Arc<TransportSession>> {
        self.sessions
            .get(id)
            .map(|entry| Arc::clone(&entry))
            .ok_or_else(|| AppError::SessionNotFound(id.to_string()))
    }

    /// Connect a session and hand it back for direct use.
    pub fn connect(&self, id: &str, timeout: Duration) -> AppResult<Arc<TransportSession>> {
        let session = self.get(id)?;
        session.connect(timeout)?;
        Ok(session)
    }

    pub fn execute_command(
        &self,
        id: &str,
        command: &str,
        timeout: Option<Duration>,
    ) -> AppResult<CommandOutput> {
        self.get(id)?.execute_command(command, timeout)
    }

    /// Disconnect a session. The registry entry stays; the session can be
    /// reconnected under the same id.
    pub fn disconnect(&self, id: &str) -> AppResult<()> {
        self.get(id)?.disconnect();
        Ok(())
    }

    /// Disconnect and drop a session from the registry.
    pub fn remove(&self, id: &str) -> AppResult<()> {
        let (id, session) = self
            .sessions
            .remove(id)
            .ok_or_else(|| AppError::SessionNotFound(id.to_string()))?;
        session.disconnect();
        tracing::info!("Removed session {}", id);
        Ok(())
    }

    /// Tear down every session and clear the registry.
    pub fn disconnect_all(&self) {
        let sessions: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.sessions.clear();
        for session in sessions {
            session.disconnect();
        }
    }

    /// Tear down and re-establish a session's transport, keeping its id and
    /// profile.
    pub fn reconnect(&self, id: &str, timeout: Duration) -> AppResult<Arc<TransportSession>> {
        let session = self.get(id)?;
        session.disconnect();
        session.connect(timeout)?;
        Ok(session)
    }

    /// Read-only snapshot of every session for display.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<_> = self.sessions.iter().map(|entry| entry.value().info()).collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    /// Remove every session whose transport is no longer alive. Returns the
    /// removed ids.
    pub fn cleanup_dead(&self) -> Vec<String> {
        let dead: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| !entry.value().is_alive())
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = Vec::new();
        for id in dead {
            if let Some((id, session)) = self.sessions.remove(&id) {
                session.disconnect();
                removed.push(id);
            }
        }

        if !removed.is_empty() {
            tracing::info!("Cleaned up {} dead session(s)", removed.len());
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceProfile;

    fn test_registry() -> ConnectionRegistry {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ProfileStore::load(dir.path()).unwrap();
        let mut profile = DeviceProfile::new("testbox", "127.0.0.1", "tester");
        profile.password = Some("hunter2".to_string());
        store.add(profile);
        ConnectionRegistry::new(Arc::new(RwLock::new(store)))
    }

    #[test]
    fn test_create_unknown_profile_fails() {
        let registry = test_registry();
        let err = registry.create("unknown-profile", None).unwrap_err();
        assert!(matches!(err, AppError::ProfileNotFound(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_auto_ids_are_unique_and_monotonic() {
        let registry = test_registry();
        let first = registry.create("testbox", None).unwrap();
        let second = registry.create("testbox", None).unwrap();
        assert_eq!(first, "conn-1");
        assert_eq!(second, "conn-2");
        assert_ne!(first, second);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_explicit_id_is_used() {
        let registry = test_registry();
        let id = registry.create("testbox", Some("nas-main")).unwrap();
        assert_eq!(id, "nas-main");
        assert!(registry.get("nas-main").is_ok());
    }

    #[test]
    fn test_duplicate_explicit_id_is_rejected() {
        let registry = test_registry();
        registry.create("testbox", Some("nas-main")).unwrap();
        assert!(registry.create("testbox", Some("nas-main")).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_auto_id_skips_taken_explicit_id() {
        let registry = test_registry();
        registry.create("testbox", Some("conn-1")).unwrap();
        let id = registry.create("testbox", None).unwrap();
        assert_eq!(id, "conn-2");
    }

    #[test]
    fn test_unknown_session_id_fails() {
        let registry = test_registry();
        assert!(matches!(
            registry.execute_command("nope", "uptime", None).unwrap_err(),
            AppError::SessionNotFound(_)
        ));
        assert!(matches!(
            registry.disconnect("nope").unwrap_err(),
            AppError::SessionNotFound(_)
        ));
        assert!(matches!(
            registry.remove("nope").unwrap_err(),
            AppError::SessionNotFound(_)
        ));
    }

    #[test]
    fn test_execute_on_disconnected_session_fails() {
        let registry = test_registry();
        let id = registry.create("testbox", None).unwrap();
        let err = registry.execute_command(&id, "uptime", None).unwrap_err();
        assert!(matches!(err, AppError::NotConnected(_)));
        // The entry itself survives; only the command failed.
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_disconnect_keeps_entry() {
        let registry = test_registry();
        let id = registry.create("testbox", None).unwrap();
        registry.disconnect(&id).unwrap();
        assert!(registry.get(&id).is_ok());
    }

    #[test]
    fn test_remove_drops_entry() {
        let registry = test_registry();
        let id = registry.create("testbox", None).unwrap();
        registry.remove(&id).unwrap();
        assert!(registry.get(&id).is_err());
    }

    #[test]
    fn test_disconnect_all_clears_registry() {
        let registry = test_registry();
        registry.create("testbox", None).unwrap();
        registry.create("testbox", None).unwrap();
        let sessions: Vec<_> = (1..=2).map(|n| registry.get(&format!("conn-{}", n)).unwrap()).collect();

        registry.disconnect_all();
        assert!(registry.is_empty());
        for session in sessions {
            assert!(!session.is_alive());
        }
    }

    #[test]
    fn test_list_snapshot() {
        let registry = test_registry();
        let id = registry.create("testbox", None).unwrap();
        let infos = registry.list();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].id, id);
        assert_eq!(infos[0].hostname, "127.0.0.1");
        assert_eq!(infos[0].username, "tester");
        assert!(!infos[0].connected);
        assert!(!infos[0].alive);
    }

    #[test]
    fn test_cleanup_dead_removes_only_dead_sessions() {
        let registry = test_registry();
        // Never-connected sessions are not alive and get collected.
        registry.create("testbox", None).unwrap();
        registry.create("testbox", None).unwrap();
        assert_eq!(registry.len(), 2);

        let mut removed = registry.cleanup_dead();
        removed.sort();
        assert_eq!(removed, vec!["conn-1".to_string(), "conn-2".to_string()]);
        assert!(registry.is_empty());

        // Repeated calls are safe.
        assert!(registry.cleanup_dead().is_empty());
    }
}
