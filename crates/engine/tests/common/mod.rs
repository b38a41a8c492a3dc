//! In-process test mesh: nodes over the memory transport

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use meshq_engine::foundation::MemoryPartition;
use meshq_engine::foundation::types::{DestinationName, QueuedMessage};
use meshq_engine::{EngineConfig, QueueEngine};
use meshq_network::NetworkManager;
use meshq_topology::{Node, NodeId, TopologyManager, TopologyManagerConfig};
use meshq_topology_mock::MockTopologyAdaptor;
use meshq_transport_memory::MemoryTransport;

pub type TestEngine = QueueEngine<MemoryTransport, MockTopologyAdaptor>;

/// One running node of the test mesh
pub struct TestNode {
    pub node_id: NodeId,
    pub engine: Arc<TestEngine>,
    pub network: Arc<NetworkManager<MemoryTransport, MockTopologyAdaptor>>,
}

impl TestNode {
    /// Make this node's topology view current
    pub async fn refresh_topology(&self) {
        self.network.topology().refresh_topology().await.unwrap();
    }
}

/// Shared mock topology all test nodes register in
pub struct TestMesh {
    pub adaptor: Arc<MockTopologyAdaptor>,
}

impl TestMesh {
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt().try_init();
        Self {
            adaptor: Arc::new(MockTopologyAdaptor::new()),
        }
    }

    /// Start a node with the given engine configuration
    pub async fn start_node(&self, config: EngineConfig) -> TestNode {
        let node_id = NodeId::new();
        self.adaptor
            .add_node(Node::new(node_id.clone(), format!("mem://{node_id}")));

        let transport = Arc::new(MemoryTransport::new(node_id.clone()));
        let topology = Arc::new(TopologyManager::with_config(
            self.adaptor.clone(),
            node_id.clone(),
            TopologyManagerConfig {
                // Tests drive refreshes explicitly
                refresh_interval: Duration::from_secs(3600),
            },
        ));
        let network = Arc::new(NetworkManager::new(node_id.clone(), transport, topology));

        let engine = QueueEngine::new(config, network.clone());
        engine.start().await.unwrap();

        TestNode {
            node_id,
            engine,
            network,
        }
    }
}

/// Engine configuration with short protocol timeouts for tests
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.anycast.get_timeout = Duration::from_millis(500);
    config.anycast.liveness_interval = Duration::from_millis(100);
    config.anycast.expiry_timeout = Duration::from_millis(400);
    config.gathering.local_weighting = 0;
    config.gathering.reattach_interval = Duration::from_millis(50);
    config.gathering.no_response_attach_interval = Duration::from_millis(20);
    config
}

/// Host a partition on a node, pre-loaded with tagged payloads
pub fn host_partition(node: &TestNode, destination: &str, payloads: &[&str]) -> Arc<MemoryPartition> {
    let partition = Arc::new(MemoryPartition::new(DestinationName::from(destination)));
    for p in payloads {
        partition.enqueue(QueuedMessage::new(p.as_bytes().to_vec()));
    }
    node.engine.register_partition(partition.clone());
    partition
}

/// Decode a pulled payload for assertions
pub fn payload(message: QueuedMessage) -> String {
    String::from_utf8(message.payload.to_vec()).unwrap()
}
