//! Process context: the one place owning the logical clock, the transport
//! hub, the table manager and the discovery collaborator.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, DiscoveryMode};
use crate::core::identity::PeerId;
use crate::core::time::LogicalClock;
use crate::net::discovery::{Discovery, FileDiscovery, ServerDiscovery};
use crate::net::hub::{Hub, LocalHub, LocalNetwork};
use crate::table::{NetTable, NetTableManager, TableDescriptor};
use crate::txn::{ParallelCommit, Transaction, Workspace};

pub struct Core {
    config: Config,
    clock: Arc<LogicalClock>,
    manager: Arc<NetTableManager>,
    hub: Arc<LocalHub>,
    discovery: Option<Box<dyn Discovery>>,
}

impl Core {
    /// Bring up a peer on the in-process transport.
    pub fn init(own: PeerId, config: Config, network: &LocalNetwork) -> Self {
        crate::telemetry::init(&config.logging);
        let clock = Arc::new(LogicalClock::new());
        let manager = Arc::new(NetTableManager::new(
            config.use_raft,
            config.legacy_peer_timeout,
            Arc::clone(&clock),
        ));
        let hub = Arc::new(LocalHub::attach(
            network,
            own,
            Arc::clone(&clock),
            Arc::clone(&manager) as Arc<dyn crate::net::hub::MessageHandler>,
            Duration::from_millis(config.simulated_lag_ms),
        ));
        manager.set_hub(Arc::clone(&hub) as Arc<dyn Hub>);

        let discovery: Option<Box<dyn Discovery>> = match config.discovery.mode {
            DiscoveryMode::File => config.discovery.directory.clone().map(|directory| {
                Box::new(FileDiscovery::new(
                    directory,
                    hub.own_peer().clone(),
                    Duration::from_secs(config.discovery.timeout_seconds),
                )) as Box<dyn Discovery>
            }),
            DiscoveryMode::Server => {
                let server = config
                    .discovery
                    .server
                    .as_deref()
                    .and_then(|raw| match PeerId::parse(raw) {
                        Ok(peer) => Some(peer),
                        Err(error) => {
                            tracing::error!(%error, "discovery server endpoint invalid");
                            None
                        }
                    });
                server.map(|server| {
                    Box::new(ServerDiscovery::new(
                        Arc::clone(&hub) as Arc<dyn Hub>,
                        server,
                    )) as Box<dyn Discovery>
                })
            }
        };
        if let Some(discovery) = &discovery {
            if config.discovery.clear {
                discovery.clear();
            }
            discovery.lock();
            discovery.announce();
            discovery.unlock();
        }

        Self {
            config,
            clock,
            manager,
            hub,
            discovery,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn clock(&self) -> &Arc<LogicalClock> {
        &self.clock
    }

    pub fn manager(&self) -> &Arc<NetTableManager> {
        &self.manager
    }

    pub fn hub(&self) -> &Arc<LocalHub> {
        &self.hub
    }

    pub fn own_peer(&self) -> &PeerId {
        self.hub.own_peer()
    }

    pub fn discovery(&self) -> Option<&dyn Discovery> {
        self.discovery.as_deref()
    }

    pub fn add_table(&self, descriptor: TableDescriptor) -> Arc<NetTable> {
        self.manager.add_table(descriptor)
    }

    pub fn get_table(&self, name: &str) -> Option<Arc<NetTable>> {
        self.manager.get_table(name)
    }

    pub fn begin_transaction(&self) -> Transaction {
        let mut txn = Transaction::begin(Arc::clone(&self.manager));
        txn.set_blame_commit(self.config.blame_commit);
        txn
    }

    pub fn begin_transaction_with(&self, workspace: Arc<Workspace>) -> Transaction {
        let mut txn = Transaction::begin_with(Arc::clone(&self.manager), workspace);
        txn.set_blame_commit(self.config.blame_commit);
        txn
    }

    pub fn begin_transaction_on(&self, predecessor: &ParallelCommit) -> Transaction {
        let mut txn = Transaction::begin_on(Arc::clone(&self.manager), predecessor);
        txn.set_blame_commit(self.config.blame_commit);
        txn
    }

    /// Announced shutdown: leave chunks, withdraw from discovery, detach.
    pub fn shutdown(self) {
        self.manager.leave_all_chunks();
        if let Some(discovery) = &self.discovery {
            discovery.lock();
            discovery.remove(self.hub.own_peer());
            discovery.unlock();
        }
        self.manager.kill();
        self.hub.detach();
    }

    /// Unannounced teardown, simulating a crash.
    pub fn kill(self) {
        self.manager.kill();
        self.hub.detach();
    }
}
