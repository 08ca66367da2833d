//! Retrieval fallback tests over the in-memory network

mod common;

use common::*;
use hop_core::{Blockstore, ExchangeError, Fault, MockNet};
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_client_announce_then_fetch_back_after_purge() {
    init_tracing();

    let net = MockNet::new();
    let client = spawn_node(&net).await;
    let providers = spawn_nodes(&net, 10).await;
    net.connect_all();

    let root = random_block(128 * 1024);
    let mut events = collect_events(&client.exchange);
    client.exchange.has_block(root.clone()).await.unwrap();

    // first provider to finish is visible in the registry
    let first = expect_events(&mut events, 1, Duration::from_secs(10)).await[0];
    let known = client
        .exchange
        .supply()
        .provider_peers_for_content(&root.cid)
        .unwrap();
    assert!(known.contains(&first.provider));

    let provider = providers
        .iter()
        .find(|p| p.node.peer_id() == first.provider)
        .unwrap();
    assert_eq!(provider.node.store().get(&root.cid).await.unwrap().data, root.data);

    // drop the client's own copy
    client.node.store().delete(&root.cid).await.unwrap();
    assert!(matches!(
        client.exchange.get_local(&root.cid).await,
        Err(ExchangeError::NotFoundLocally(_))
    ));

    let fetched = client.exchange.get_block(&root.cid).await.unwrap();
    assert_eq!(fetched.data, root.data);
    assert_eq!(client.exchange.metrics().retrievals_remote(), 1);

    // the fetched copy is kept locally
    assert!(client.exchange.get_local(&root.cid).await.is_ok());
}

#[tokio::test]
async fn test_not_found_anywhere() {
    init_tracing();

    let net = MockNet::new();
    let nodes = spawn_nodes(&net, 3).await;
    net.connect_all();

    let missing = random_block(64);
    assert!(matches!(
        nodes[0].exchange.get_block(&missing.cid).await,
        Err(ExchangeError::NotFoundAnywhere(_))
    ));
    assert_eq!(nodes[0].exchange.metrics().retrievals_failed(), 1);
}

#[tokio::test]
async fn test_bad_providers_are_skipped() {
    init_tracing();

    let net = MockNet::new();
    let client = spawn_node(&net).await;
    let corrupt = spawn_node(&net).await;
    let stalled = spawn_node(&net).await;
    let honest = spawn_node(&net).await;
    net.connect_all();

    let block = random_block(4096);
    for node in [&corrupt, &stalled, &honest] {
        node.node.store().put(block.clone()).await.unwrap();
    }
    corrupt.node.set_fault(Fault::Corrupt);
    stalled.node.set_fault(Fault::Stall);

    let registry = client.exchange.supply().registry();
    for node in [&corrupt, &stalled, &honest] {
        registry.add(block.cid, node.node.peer_id());
    }

    let fetched = client.exchange.get_block(&block.cid).await.unwrap();
    assert_eq!(fetched, block);
}

#[tokio::test]
async fn test_only_bad_providers_is_not_found_within_timeout() {
    init_tracing();

    let net = MockNet::new();
    let client = spawn_node(&net).await;
    let corrupt = spawn_node(&net).await;
    let stalled = spawn_node(&net).await;
    let gone = spawn_node(&net).await;
    net.connect_all();
    net.disconnect(&client.node.peer_id(), &gone.node.peer_id());

    let block = random_block(4096);
    for node in [&corrupt, &stalled, &gone] {
        node.node.store().put(block.clone()).await.unwrap();
        client
            .exchange
            .supply()
            .registry()
            .add(block.cid, node.node.peer_id());
    }
    corrupt.node.set_fault(Fault::Corrupt);
    stalled.node.set_fault(Fault::Stall);

    let started = Instant::now();
    let result = client.exchange.get_block(&block.cid).await;
    assert!(matches!(result, Err(ExchangeError::NotFoundAnywhere(_))));

    // one stalled candidate costs at most one transfer timeout
    assert!(started.elapsed() < fast_config().transfer_timeout * 3);
    assert!(!client.node.store().has(&block.cid).await);
}

#[tokio::test]
async fn test_dropping_get_block_cancels_the_pull() {
    init_tracing();

    let net = MockNet::new();
    let client = spawn_node(&net).await;
    let stalled = spawn_node(&net).await;
    net.connect_all();

    let block = random_block(128);
    stalled.node.store().put(block.clone()).await.unwrap();
    stalled.node.set_fault(Fault::Stall);
    client
        .exchange
        .supply()
        .registry()
        .add(block.cid, stalled.node.peer_id());

    let result = tokio::time::timeout(
        Duration::from_millis(50),
        client.exchange.get_block(&block.cid),
    )
    .await;
    assert!(result.is_err());

    // the provider side of the abandoned pull winds down too
    wait_until(Duration::from_secs(1), "stalled pull to be released", || {
        net.active_pulls() == 0
    })
    .await;
}

#[tokio::test]
async fn test_get_blocks_keeps_request_order() {
    init_tracing();

    let net = MockNet::new();
    let client = spawn_node(&net).await;
    let provider = spawn_node(&net).await;
    net.connect_all();

    let local = random_block(100);
    let remote = random_block(200);
    let missing = random_block(300);

    client.node.store().put(local.clone()).await.unwrap();
    provider.node.store().put(remote.clone()).await.unwrap();
    client
        .exchange
        .supply()
        .registry()
        .add(remote.cid, provider.node.peer_id());

    let results = client
        .exchange
        .get_blocks(&[local.cid, remote.cid, missing.cid])
        .await;

    assert_eq!(results.len(), 3);
    assert_eq!(results[0].as_ref().unwrap(), &local);
    assert_eq!(results[1].as_ref().unwrap(), &remote);
    assert!(matches!(results[2], Err(ExchangeError::NotFoundAnywhere(_))));
}

#[tokio::test]
async fn test_announce_requires_local_block() {
    let net = MockNet::new();
    let node = spawn_node(&net).await;

    let block = random_block(10);
    assert!(matches!(
        node.exchange.announce(&block.cid).await,
        Err(ExchangeError::NotFoundLocally(_))
    ));
}

#[tokio::test]
async fn test_is_online_follows_links_and_close() {
    let net = MockNet::new();
    let a = spawn_node(&net).await;
    let b = spawn_node(&net).await;

    assert!(!a.exchange.is_online());
    net.connect(&a.node.peer_id(), &b.node.peer_id());
    assert!(a.exchange.is_online());

    a.exchange.close().await;
    assert!(!a.exchange.is_online());
}
