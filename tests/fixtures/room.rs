//! Multi-node room fixture
//!
//! Every node gets its own relay client and channel factory; all of them
//! share one [`RelayHub`] and one [`MemoryNetwork`], so tests can shape the
//! links between nodes (bandwidth, blackholes, severed channels) while the
//! nodes run the real session and transfer code.
//!
//! # Example
//!
//! ```ignore
//! let room = RoomFixture::new();
//! let alice = room.join("alice", fast_config()).await;
//! let bob = room.join("bob", fast_config()).await;
//! alice.wait_connected(&bob.id).await;
//! ```

use crate::test_helpers::{WAIT, ci_timeout};
use peerdrop_core::{Config, EventStream, PeerConfig, PeerState, SessionRegistry, TransferConfig};
use peerdrop_discovery::PeerId;
use peerdrop_discovery::relay::{RelayClient, RelayHub};
use peerdrop_transport::MemoryNetwork;
use std::sync::Arc;

/// Room every fixture node joins
pub const ROOM: &str = "it-room";

/// Session timings scaled down for tests
pub fn fast_config() -> Config {
    Config {
        peer: PeerConfig {
            connection_timeout_ms: 3_000,
            probe_timeout_ms: 1_000,
            keepalive_interval_ms: 500,
            max_missed_keepalive: 4,
            reconnect_base_delay_ms: 50,
            reconnect_max_delay_ms: 400,
            max_reconnect_attempts: 5,
            reconnect_jitter: false,
            encryption: true,
        },
        transfer: TransferConfig {
            chunk_size: 4 * 1024,
            backpressure_high_water_bytes: 32 * 1024,
            progress_interval_ms: 20,
            ..TransferConfig::default()
        },
    }
}

/// Shared relay and channel network for a set of nodes
#[derive(Clone, Default)]
pub struct RoomFixture {
    /// Signaling relay
    pub hub: RelayHub,
    /// Simulated direct links
    pub network: MemoryNetwork,
}

/// One running node
pub struct TestNode {
    /// Node identity
    pub id: PeerId,
    /// The node's registry
    pub registry: SessionRegistry,
    /// Application events of the node
    pub events: EventStream,
    /// Relay connection, kept so tests can drop the node from the room
    pub client: Arc<RelayClient>,
}

impl RoomFixture {
    /// Create an empty room
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a node named `id` and join it to [`ROOM`].
    ///
    /// # Panics
    ///
    /// Panics if the relay or the registry refuses the node.
    pub async fn join(&self, id: &str, config: Config) -> TestNode {
        let id = PeerId::from(id);
        let (client, signaling_events) = RelayClient::connect_as(&self.hub, id.clone(), id.as_str())
            .await
            .expect("relay connect");
        let client = Arc::new(client);
        let factory = self.network.factory(id.clone());
        let (registry, events) = SessionRegistry::new(config, client.clone(), Arc::new(factory))
            .expect("registry");
        registry.start(signaling_events).await;
        registry.join_room(ROOM).await.expect("join room");
        TestNode {
            id,
            registry,
            events,
            client,
        }
    }
}

impl TestNode {
    /// Wait until the session to `peer` is `Connected`.
    ///
    /// # Panics
    ///
    /// Panics if it never gets there.
    pub async fn wait_connected(&self, peer: &PeerId) {
        let connected = crate::test_helpers::wait_until(WAIT, || async {
            self.registry.peer_state(peer) == Some(PeerState::Connected)
                && self
                    .registry
                    .transfer_manager()
                    .connected_peers()
                    .contains(peer)
        })
        .await;
        assert!(
            connected,
            "{} never connected to {} (state {:?})",
            self.id,
            peer,
            self.registry.peer_state(peer)
        );
    }

    /// Wait until the session to `peer` reaches `state`.
    pub async fn wait_for_state(&self, peer: &PeerId, state: PeerState) -> bool {
        crate::test_helpers::wait_until(WAIT, || async {
            self.registry.peer_state(peer) == Some(state)
        })
        .await
    }

    /// Leave the room and stop every session.
    pub async fn leave(&self) {
        self.client.disconnect().await;
        self.registry.shutdown().await;
    }
}

/// Deadline for a whole transfer in these tests
pub fn transfer_timeout() -> std::time::Duration {
    ci_timeout(std::time::Duration::from_secs(20))
}
