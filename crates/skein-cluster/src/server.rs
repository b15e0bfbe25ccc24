//! Register server: the `Register` service plus its sweeper.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use skein_core::{SkeinConfig, epoch_millis};
use skein_rpc::{ConnectionHub, RpcError, Server, ServerConfig, ServerHandle, ServiceDefinition};
use skein_state::StateStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::error::{ClusterError, ClusterResult};
use crate::registry::{Registry, RegistryConfig};
use crate::service::{REGISTER_SERVICE, RegisterService};
use crate::sweeper::spawn_sweeper;

#[derive(Debug, Clone)]
pub struct RegisterServerConfig {
    pub server: ServerConfig,
    pub shared_key: Option<String>,
    pub registry: RegistryConfig,
    pub sweep_interval: Duration,
    /// Directory of the on-disk membership table; in memory when `None`.
    pub data_dir: Option<PathBuf>,
}

impl RegisterServerConfig {
    pub fn new(listen: impl Into<String>) -> Self {
        Self {
            server: ServerConfig {
                listen: listen.into(),
                ..ServerConfig::default()
            },
            shared_key: None,
            registry: RegistryConfig::default(),
            sweep_interval: Duration::from_secs(10),
            data_dir: None,
        }
    }

    /// `[server]` tunes the transport, `[register]` supplies the address,
    /// key and membership policy.
    pub fn from_config(config: &SkeinConfig) -> ClusterResult<Self> {
        let mut server = ServerConfig::from_section(&config.server).map_err(RpcError::from)?;
        let register = &config.register;
        server.listen = format!("{}:{}", register.ip, register.port);
        Ok(Self {
            server,
            shared_key: register.shared_key.clone().filter(|k| !k.is_empty()),
            registry: RegistryConfig::from_section(register),
            sweep_interval: Duration::from_secs(register.sweep_secs.max(1)),
            data_dir: register.data_dir.as_ref().map(PathBuf::from),
        })
    }

    fn open_store(&self) -> ClusterResult<StateStore> {
        match &self.data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(|e| {
                    ClusterError::Config(format!("cannot create {}: {e}", dir.display()))
                })?;
                Ok(StateStore::open(&dir.join("members.redb"))?)
            }
            None => Ok(StateStore::open_in_memory()?),
        }
    }
}

pub struct RegisterServer;

impl RegisterServer {
    pub async fn start(config: RegisterServerConfig) -> ClusterResult<RegisterHandle> {
        let store = config.open_store()?;
        let registry = Registry::new(store, config.registry.clone());
        registry.recover(epoch_millis())?;

        let factory_registry = registry.clone();
        let definition = ServiceDefinition::new(REGISTER_SERVICE, move |_ctx| {
            RegisterService::new(factory_registry.clone())
        })
        .with_key(config.shared_key.as_deref());
        let codec = definition.codec().clone();

        let mut server = Server::new(config.server.clone());
        server.register(definition);
        let hub = server.hub();
        let handle = server.start().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweeper = spawn_sweeper(
            registry.clone(),
            hub.clone(),
            codec,
            config.sweep_interval,
            shutdown_rx,
        );
        info!(
            addr = %handle.local_addr(),
            encrypted = config.shared_key.is_some(),
            "register server started"
        );
        Ok(RegisterHandle {
            server: handle,
            registry,
            hub,
            sweeper,
            shutdown: shutdown_tx,
        })
    }
}

/// A running register server.
pub struct RegisterHandle {
    server: ServerHandle,
    registry: Registry,
    hub: ConnectionHub,
    sweeper: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl RegisterHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn hub(&self) -> &ConnectionHub {
        &self.hub
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.sweeper.await;
        self.server.shutdown().await;
        info!("register server stopped");
    }
}
