//! Settings and collaborators shared by every command.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use fpc_api::ApiClient;
use fpc_backlog::{Backlog, HealthMonitor};
use fpc_config::{CliSettings, ConfigStore, Settings, SiteConfig, StorageBackend};
use fpc_core::SiteCache;
use fpc_storage::{Clock, FsStorage, Storage, SystemClock};
use fpc_storage_kv::{KvStorage, MemoryKv};
use fpc_transport::{HttpTransport, Transport};

use crate::error::CliError;

/// Options accepted by every command.
#[derive(Args, Debug, Default)]
pub(crate) struct GlobalArgs {
    /// Path to configuration file (default: auto-discover fpc.toml).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Data directory holding the cache (overrides config).
    #[arg(long, global = true, env = "FPC_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Site id (overrides config).
    #[arg(long, global = true, env = "FPC_SITE_ID")]
    pub site_id: Option<String>,

    /// Remote API base URL (overrides config).
    #[arg(long, global = true)]
    pub api_url: Option<String>,

    /// Do not queue failed remote operations.
    #[arg(long, global = true)]
    pub no_backlog: bool,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

impl GlobalArgs {
    fn cli_settings(&self) -> CliSettings {
        CliSettings {
            data_dir: self.data_dir.clone(),
            site_id: self.site_id.clone(),
            api_url: self.api_url.clone(),
            backlog_enabled: self.no_backlog.then_some(false),
            quick_purge: None,
        }
    }
}

/// Loaded settings with the storage and clock built from them.
pub(crate) struct Context {
    pub settings: Settings,
    pub storage: Arc<dyn Storage>,
    pub clock: Arc<dyn Clock>,
}

impl Context {
    pub(crate) fn load(args: &GlobalArgs) -> Result<Self, CliError> {
        let settings = Settings::load(args.config.as_deref(), Some(&args.cli_settings()))?;
        Ok(Self::from_settings(settings))
    }

    pub(crate) fn from_settings(settings: Settings) -> Self {
        let storage: Arc<dyn Storage> = match settings.storage.backend {
            StorageBackend::Fs => Arc::new(FsStorage::new(settings.storage.data_dir.clone())),
            StorageBackend::Memory => {
                tracing::warn!("Memory storage backend keeps nothing between runs");
                Arc::new(KvStorage::new(
                    Arc::new(MemoryKv::new()),
                    settings.storage.namespace.clone(),
                ))
            }
        };
        Self {
            settings,
            storage,
            clock: Arc::new(SystemClock),
        }
    }

    pub(crate) fn health(&self) -> HealthMonitor {
        HealthMonitor::load(Arc::clone(&self.storage), Arc::clone(&self.clock))
    }

    pub(crate) fn backlog(&self) -> Backlog {
        Backlog::new(Arc::clone(&self.storage), Arc::clone(&self.clock))
            .with_enabled(self.settings.backlog.enabled)
    }

    /// Site config stored by the last fetch, or defaults when there is none.
    pub(crate) fn site_config(&self) -> Result<SiteConfig, CliError> {
        let store = ConfigStore::new(&self.settings.site.id);
        Ok(store.load(self.storage.as_ref())?.unwrap_or_default())
    }

    /// Site cache that may talk to the remote service.
    pub(crate) fn site_cache(&self) -> Result<SiteCache, CliError> {
        self.settings.require_site()?;
        self.build_site_cache()
    }

    /// Site cache for commands that only look at local files. Credentials
    /// may be missing.
    pub(crate) fn local_site_cache(&self) -> Result<SiteCache, CliError> {
        self.build_site_cache()
    }

    fn build_site_cache(&self) -> Result<SiteCache, CliError> {
        let site = &self.settings.site;
        let transport_settings = &self.settings.transport;
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(
            &site.api_url,
            transport_settings.connect_timeout(),
            transport_settings.timeout(),
        ));
        let api = ApiClient::new(
            site.id.as_str(),
            site.secret.as_str(),
            transport,
            Arc::new(self.health()),
            Arc::new(self.backlog()),
        )
        .with_retry(transport_settings.attempts, transport_settings.retry_delay());

        Ok(SiteCache::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.clock),
            self.site_config()?,
            api,
            self.settings.cache.clone(),
        )
        .with_tag_retry_delay(transport_settings.tag_retry_delay()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use pretty_assertions::assert_eq;

    fn write_config(dir: &Path, content: &str) -> PathBuf {
        let path = dir.join("fpc.toml");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_cli_args_override_config() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = write_config(temp_dir.path(), "[site]\nid = \"from-file\"\n");
        let args = GlobalArgs {
            config: Some(path),
            site_id: Some("from-cli".to_owned()),
            no_backlog: true,
            ..GlobalArgs::default()
        };

        let context = Context::load(&args).unwrap();

        assert_eq!(context.settings.site.id, "from-cli");
        assert!(!context.settings.backlog.enabled);
        assert!(!context.backlog().is_enabled());
        assert_eq!(context.settings.storage.data_dir, temp_dir.path().join("data"));
    }

    #[test]
    fn test_remote_commands_need_credentials() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = write_config(temp_dir.path(), "[site]\nid = \"site1\"\n");
        let context = Context::load(&GlobalArgs {
            config: Some(path),
            ..GlobalArgs::default()
        })
        .unwrap();

        assert!(matches!(context.site_cache(), Err(CliError::Config(_))));
        assert!(context.local_site_cache().is_ok());
    }

    #[test]
    fn test_site_config_read_from_data_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = write_config(
            temp_dir.path(),
            "[site]\nid = \"site1\"\nsecret = \"s\"\n\n[storage]\ndata_dir = \".\"\n",
        );
        std::fs::write(
            temp_dir.path().join("site1-config.json"),
            r#"{"PageCache": {"ExpireTime": 600}}"#,
        )
        .unwrap();

        let context = Context::load(&GlobalArgs {
            config: Some(path),
            ..GlobalArgs::default()
        })
        .unwrap();

        assert_eq!(context.site_config().unwrap().page_cache.expire_time, 600);
        assert!(context.site_cache().is_ok());
    }
}
