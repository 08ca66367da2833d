//! Shared harness for the in-memory network tests

#![allow(dead_code)]

use hop_core::{
    Block, Event, Exchange, ExchangeBuilder, MockNet, MockNode, SupplyConfig, TransferAuthorizer,
};
use rand::RngCore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize tracing for tests
pub fn init_tracing() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

pub struct TestNode {
    pub node: MockNode,
    pub exchange: Exchange,
}

/// Tunables small enough to keep failure paths quick
pub fn fast_config() -> SupplyConfig {
    SupplyConfig {
        transfer_timeout: Duration::from_millis(500),
        retry_interval: Duration::from_millis(20),
        ..SupplyConfig::default()
    }
}

pub fn builder_for(node: &MockNode) -> ExchangeBuilder {
    let handle = Arc::new(node.clone());
    Exchange::builder()
        .with_blockstore(node.store())
        .with_host(handle.clone())
        .with_transfer(handle)
        .with_supply_config(fast_config())
}

pub async fn spawn_node(net: &MockNet) -> TestNode {
    let node = net.add_memory_node();
    let exchange = builder_for(&node).build().await.unwrap();
    TestNode { node, exchange }
}

pub async fn spawn_node_with(net: &MockNet, authorizer: TransferAuthorizer) -> TestNode {
    let node = net.add_memory_node();
    let exchange = builder_for(&node)
        .with_authorizer(authorizer)
        .build()
        .await
        .unwrap();
    TestNode { node, exchange }
}

pub async fn spawn_nodes(net: &MockNet, count: usize) -> Vec<TestNode> {
    let mut nodes = Vec::with_capacity(count);
    for _ in 0..count {
        nodes.push(spawn_node(net).await);
    }
    nodes
}

pub fn random_block(size: usize) -> Block {
    let mut data = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut data);
    Block::new(data).unwrap()
}

/// Route every event seen by `exchange` into a channel
pub fn collect_events(exchange: &Exchange) -> mpsc::UnboundedReceiver<Event> {
    let (tx, rx) = mpsc::unbounded_channel();
    exchange.supply().subscribe_to_events(move |event| {
        let _ = tx.send(event);
    });
    rx
}

/// Receive `count` events or panic after `within`
pub async fn expect_events(
    rx: &mut mpsc::UnboundedReceiver<Event>,
    count: usize,
    within: Duration,
) -> Vec<Event> {
    tokio::time::timeout(within, async {
        let mut events = Vec::with_capacity(count);
        while events.len() < count {
            events.push(rx.recv().await.expect("event bus closed"));
        }
        events
    })
    .await
    .expect("timed out waiting for provider events")
}

/// Assert no event arrives for `quiet`
pub async fn expect_no_events(rx: &mut mpsc::UnboundedReceiver<Event>, quiet: Duration) {
    if let Ok(Some(event)) = tokio::time::timeout(quiet, rx.recv()).await {
        panic!("unexpected event {:?}", event);
    }
}

/// Poll `check` until it holds or panic after `within`
pub async fn wait_until(within: Duration, what: &str, mut check: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(within, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}
