use crate::config::{self, AppSettings, ProfileStore};
use crate::error::AppResult;
use crate::ssh::ConnectionRegistry;
use parking_lot::RwLock;
use std::sync::Arc;

/// Application context, constructed once at startup and passed by reference
/// to whatever needs it.
pub struct AppContext {
    pub profiles: Arc<RwLock<ProfileStore>>,
    pub settings: AppSettings,
    pub sessions: Arc<ConnectionRegistry>,
}

impl AppContext {
    pub fn new() -> AppResult<Self> {
        let config_dir = config::get_config_dir()?;
        std::fs::create_dir_all(&config_dir)?;

        let settings = AppSettings::load(&config_dir)?;
        let profiles = Arc::new(RwLock::new(ProfileStore::load(&config_dir)?));
        let sessions = Arc::new(ConnectionRegistry::new(Arc::clone(&profiles)));

        tracing::info!("sshdeck config dir: {:?}", config_dir);

        Ok(Self {
            profiles,
            settings,
            sessions,
        })
    }
}
