//! Assembling and running one replication node

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

use strand_core::cluster::load_node_state;
use strand_core::service::cluster_client::{ClusterClientConfig, TcpNodeTransport};
use strand_core::service::nodes::Node;
use strand_core::{
    ChangeApplier, ClusterConfig, ClusterContext, ClusterStores, Configuration, FatalHandler,
    NodeStateFile,
};

use super::shutdown::{ShutdownSignal, listen_for_os_signals, with_deadline};

const STOP_DEADLINE: Duration = Duration::from_secs(15);

/// A node that is wired up and listening for peers
pub struct RunningNode {
    pub ctx: Arc<ClusterContext>,
    pub transport: Arc<TcpNodeTransport>,
    pub listen_addr: SocketAddr,
    pub state_file: PathBuf,
    server: JoinHandle<()>,
}

impl RunningNode {
    /// Stop replication, persist the state and close the listener
    pub async fn shutdown(self) {
        with_deadline("Node stop", STOP_DEADLINE, self.ctx.stop()).await;
        self.server.abort();
        info!(node_id = self.ctx.this_node_id(), "Node stopped");
    }
}

/// Load the persisted state, build the cluster context and start listening.
///
/// The node is not started; call [`ClusterContext::start`] on `ctx`.
pub async fn bootstrap(
    configuration: &Configuration,
    init: bool,
    applier: Arc<dyn ChangeApplier>,
    on_fatal: FatalHandler,
) -> anyhow::Result<RunningNode> {
    let node_id = configuration.node_id();
    let address = configuration.node_address();
    let port = configuration.node_port();
    let data_dir = configuration.data_dir();

    let state_file = NodeStateFile::path_in(&data_dir);
    let state = load_node_state(&state_file, init, node_id, &address, port)
        .with_context(|| format!("refusing to start node {}", node_id))?;
    info!(
        node_id,
        committed = state.committed_change_id,
        stored = state.stored_change_id,
        "Loaded node state from {}",
        state_file.display()
    );

    let stores = ClusterStores::open(&data_dir)
        .with_context(|| format!("cannot open stores in {}", data_dir.display()))?;

    let mut this = Node::new(node_id, address, port);
    this.committed_change_id = state.committed_change_id;
    this.stored_change_id = state.stored_change_id;

    let transport = TcpNodeTransport::new(
        node_id,
        ClusterClientConfig::from_configuration(configuration),
    );
    let ctx = ClusterContext::new(
        ClusterConfig::from_configuration(configuration),
        this,
        transport.clone(),
        stores,
        applier,
        on_fatal,
    )
    .await;
    transport.set_handler(ctx.handler());

    for (peer_id, host, peer_port) in configuration.cluster_nodes() {
        if peer_id == node_id {
            continue;
        }
        ctx.add_peer(peer_id, &host, peer_port).await?;
    }
    ctx.set_state_file(state_file.clone());

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("cannot listen on port {}", port))?;
    let listen_addr = listener.local_addr()?;
    let server = tokio::spawn(transport.clone().serve(listener));

    Ok(RunningNode {
        ctx,
        transport,
        listen_addr,
        state_file,
        server,
    })
}

/// Run the node until Ctrl+C or SIGTERM
pub async fn run(
    configuration: Configuration,
    init: bool,
    applier: Arc<dyn ChangeApplier>,
    on_fatal: FatalHandler,
) -> anyhow::Result<()> {
    let node = match bootstrap(&configuration, init, applier, on_fatal).await {
        Ok(node) => node,
        Err(e) => {
            error!("{:#}", e);
            return Err(e);
        }
    };

    let shutdown = ShutdownSignal::new();
    listen_for_os_signals(shutdown.clone());

    node.ctx.start().await?;
    let sampler = crate::metrics::spawn_sampler(
        node.ctx.clone(),
        Duration::from_millis(configuration.heartbeat_interval_ms().max(100)),
        shutdown.clone(),
    );
    info!(
        node_id = node.ctx.this_node_id(),
        "Node running on {}, {} member(s) configured",
        node.listen_addr,
        node.ctx.health_summary().total
    );

    shutdown.wait().await;
    sampler.abort();
    node.shutdown().await;
    Ok(())
}
