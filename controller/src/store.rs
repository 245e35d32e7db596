use std::{collections::BTreeMap, io::ErrorKind, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

use recirc_common::{config::MAX_TEMPERATURE_KEY, RuntimeConfig, TargetConfig};

/// Key-value persistence for user preferences.
#[async_trait]
pub trait PreferenceStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;
}

/// Reads the stored target, falling back to the default when the stored
/// value is missing, unreadable or outside the safe bounds.
pub async fn load_target<S: PreferenceStore + ?Sized>(store: &S) -> TargetConfig {
    match store.get(MAX_TEMPERATURE_KEY).await {
        Ok(Some(raw)) => {
            let target = TargetConfig::from_stored(Some(&raw));
            if raw.trim().parse::<f32>().ok() != Some(target.max_temperature) {
                warn!(
                    "ignoring stored {MAX_TEMPERATURE_KEY} {raw:?}; using {}",
                    target.max_temperature
                );
            }
            target
        }
        Ok(None) => TargetConfig::default(),
        Err(err) => {
            warn!("failed to read {MAX_TEMPERATURE_KEY} preference: {err:#}");
            TargetConfig::default()
        }
    }
}

/// File-backed store: `runtime.json` for deployment settings and
/// `preferences.json` for the flat preference map.
#[derive(Clone)]
pub struct AppStore {
    runtime_path: Arc<PathBuf>,
    preferences_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl AppStore {
    pub fn new() -> Self {
        let data_dir = std::env::var("RECIRC_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.recirculator"));
        Self::in_dir(data_dir)
    }

    pub fn in_dir(data_dir: PathBuf) -> Self {
        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            preferences_path: Arc::new(data_dir.join("preferences.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn read_preferences(&self) -> anyhow::Result<BTreeMap<String, String>> {
        match tokio::fs::read(self.preferences_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl PreferenceStore for AppStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let _guard = self.lock.lock().await;
        Ok(self.read_preferences().await?.remove(key))
    }

    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let mut preferences = self.read_preferences().await?;
        preferences.insert(key.to_string(), value.to_string());

        let path = self.preferences_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(&preferences)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}
