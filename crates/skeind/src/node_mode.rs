//! Node mode — serves RPC and stays registered with the cluster.
//!
//! In this mode, the daemon:
//! 1. Resolves the advertised port (from `[node]` or the listen address)
//! 2. Starts the registration client and its membership view
//! 3. Serves the built-in `Node` service on `[server].listen`
//! 4. Runs until Ctrl-C or until the register server rejects the node

use std::net::SocketAddr;

use anyhow::{Context, bail};
use skein_cluster::{ClusterError, NodeService, RegistrationClient, RegistrationConfig};
use skein_core::SkeinConfig;
use skein_rpc::{ClientState, Server, ServerConfig, ServiceDefinition};
use tracing::{info, warn};

const NODE_SERVICE: &str = "Node";

pub async fn run(mut config: SkeinConfig) -> anyhow::Result<()> {
    info!("skein daemon starting in node mode");

    if config.node.port.is_none() {
        let listen: SocketAddr = config
            .server
            .listen
            .parse()
            .with_context(|| format!("cannot derive node port from {}", config.server.listen))?;
        if listen.port() == 0 {
            bail!("node port is required when listening on an ephemeral port");
        }
        config.node.port = Some(listen.port());
    }

    // ── Registration ─────────────────────────────────────────────
    let registration = RegistrationClient::start(RegistrationConfig::from_config(&config)?);
    let view = registration.view().clone();
    let assignment = registration.subscribe_assignment();

    // ── RPC server ───────────────────────────────────────────────
    let mut server = Server::new(ServerConfig::from_section(&config.server)?);
    server.register(ServiceDefinition::new(NODE_SERVICE, move |_ctx| {
        NodeService::new(view.clone(), assignment.clone())
    }));
    let handle = server.start().await?;
    info!(addr = %handle.local_addr(), "node rpc server started");

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("shutdown signal received");
            Ok(())
        }
        result = hold_registration(&registration) => result,
    };

    registration.stop().await;
    handle.shutdown().await;
    outcome
}

/// Resolves only when the node can no longer stay registered.
async fn hold_registration(client: &RegistrationClient) -> anyhow::Result<()> {
    let assignment = match client.registered().await {
        Ok(assignment) => assignment,
        Err(ClusterError::Rejected { code, msg }) => bail!("registration rejected ({code}): {msg}"),
        Err(err) => return Err(err.into()),
    };
    info!(group = %assignment.group, id = assignment.id, "node is part of the cluster");

    let mut state = client.subscribe_state();
    let ended = state
        .wait_for(|s| matches!(s, ClientState::ClosedByServer | ClientState::Stopped))
        .await
        .map(|s| *s);
    match ended {
        Ok(ClientState::ClosedByServer) => bail!("register server closed the session"),
        _ => {
            warn!("registration session ended");
            Ok(())
        }
    }
}
