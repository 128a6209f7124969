//! Acceptance scenarios
//!
//! Transfer scenarios drive a [`TransferManager`] directly through its
//! [`PeerHandler`] side over capture channels, so every frame it emits can
//! be inspected. The liveness scenario runs complete nodes in a room.

use peerdrop_core::events::event_channel;
use peerdrop_core::peer::{ChunkHeader, PeerHandler};
use peerdrop_core::{
    ControlMessage, Error, Event, EventStream, FileOffer, MemorySource, PeerLink, PeerState,
    TransferConfig, TransferManager, TransferState,
};
use peerdrop_crypto::digest_hex;
use peerdrop_discovery::PeerId;
use peerdrop_integration_tests::fixtures::{CaptureChannel, RoomFixture, fast_config};
use peerdrop_integration_tests::test_helpers::{WAIT, next_matching, test_data, wait_until};
use std::sync::Arc;
use std::time::Duration;

fn manager(config: TransferConfig) -> (Arc<TransferManager>, EventStream) {
    let (tx, events) = event_channel();
    (TransferManager::new(PeerId::from("local"), config, tx), events)
}

async fn connect(manager: &TransferManager, peer: &str) -> Arc<CaptureChannel> {
    let channel = Arc::new(CaptureChannel::new(peer));
    let link = PeerLink::new(PeerId::from(peer), channel.clone(), 1 << 20);
    manager.on_connected(link).await;
    channel
}

fn offer(data: &[u8], chunk_size: usize, file_id: &str, sender: &str) -> FileOffer {
    FileOffer {
        file_id: file_id.into(),
        file_name: "scenario.bin".into(),
        file_type: "application/octet-stream".into(),
        file_size: data.len() as u64,
        total_chunks: (data.len() as u64).div_ceil(chunk_size as u64),
        chunk_size,
        hash: Some(digest_hex(data)),
        sender_id: PeerId::from(sender),
    }
}

/// Deliver an offer from `sender` and accept it.
async fn accept_offer(
    manager: &TransferManager,
    events: &mut EventStream,
    sender: &str,
    offer: FileOffer,
) {
    let file_id = offer.file_id.clone();
    manager
        .on_message(&PeerId::from(sender), ControlMessage::File(offer))
        .await;
    let Event::FileOffered { decision, .. } =
        next_matching(events, |e| matches!(e, Event::FileOffered { .. })).await
    else {
        unreachable!();
    };
    decision.accept();
    let accepted = wait_until(WAIT, || async {
        manager.transfer_state(&file_id).await == Some(TransferState::Accepted)
    })
    .await;
    assert!(accepted, "offer {file_id} never accepted");
}

fn chunk(file_id: &str, index: u64, total: u64) -> ChunkHeader {
    ChunkHeader {
        file_id: file_id.into(),
        chunk_index: index,
        total_chunks: total,
    }
}

// ============ Scenario A: reverse-order reassembly ============

#[tokio::test]
async fn test_reverse_order_chunks_reassemble() {
    let config = TransferConfig {
        chunk_size: 16384,
        ..TransferConfig::default()
    };
    let (manager, mut events) = manager(config);
    connect(&manager, "sender").await;

    let data = test_data(100_000);
    let offer = offer(&data, 16384, "scenario-a", "sender");
    assert_eq!(offer.total_chunks, 7);
    accept_offer(&manager, &mut events, "sender", offer).await;

    let peer = PeerId::from("sender");
    let chunks: Vec<&[u8]> = data.chunks(16384).collect();
    assert_eq!(chunks[6].len(), 1696);
    for index in (0..7u64).rev() {
        manager
            .on_chunk(
                &peer,
                chunk("scenario-a", index, 7),
                chunks[index as usize].to_vec(),
            )
            .await;
    }

    let Event::TransferCompleted { data: received, .. } =
        next_matching(&mut events, |e| matches!(e, Event::TransferCompleted { .. })).await
    else {
        unreachable!();
    };
    assert_eq!(received, Some(data));
}

// ============ Scenario B: resend request after reconnect ============

#[tokio::test]
async fn test_reconnect_requests_only_missing_chunks() {
    let config = TransferConfig {
        chunk_size: 100,
        ..TransferConfig::default()
    };
    let (manager, mut events) = manager(config);
    connect(&manager, "sender").await;

    let data = test_data(1000);
    accept_offer(&manager, &mut events, "sender", offer(&data, 100, "scenario-b", "sender")).await;

    let peer = PeerId::from("sender");
    for index in 0..3u64 {
        let start = index as usize * 100;
        manager
            .on_chunk(&peer, chunk("scenario-b", index, 10), data[start..start + 100].to_vec())
            .await;
    }

    manager.on_disconnected(&peer).await;
    next_matching(&mut events, |e| matches!(e, Event::TransferPaused { .. })).await;

    let channel = connect(&manager, "sender").await;
    let requests: Vec<Vec<u64>> = channel
        .messages()
        .into_iter()
        .filter_map(|message| match message {
            ControlMessage::ResendRequest { missing, .. } => Some(missing),
            _ => None,
        })
        .collect();
    assert_eq!(requests, vec![vec![3, 4, 5, 6, 7, 8, 9]]);
    next_matching(&mut events, |e| matches!(e, Event::TransferResumed { .. })).await;

    // Serving the request completes the transfer with the original bytes
    for index in 3..10u64 {
        let start = index as usize * 100;
        manager
            .on_chunk(&peer, chunk("scenario-b", index, 10), data[start..start + 100].to_vec())
            .await;
    }
    let Event::TransferCompleted { data: received, .. } =
        next_matching(&mut events, |e| matches!(e, Event::TransferCompleted { .. })).await
    else {
        unreachable!();
    };
    assert_eq!(received, Some(data));
}

// ============ Scenario C: accept/reject race ============

#[tokio::test]
async fn test_reject_after_accept_is_ignored() {
    let config = TransferConfig {
        chunk_size: 100,
        ..TransferConfig::default()
    };
    let (manager, mut events) = manager(config);
    let channel = connect(&manager, "receiver").await;

    let data = test_data(2_000);
    let file_id = manager
        .send_file(Arc::new(MemorySource::new(data.clone())), "race.bin", "")
        .await
        .unwrap();

    let peer = PeerId::from("receiver");
    manager
        .on_message(&peer, ControlMessage::FileAccept { file_id: file_id.clone() })
        .await;
    manager
        .on_message(&peer, ControlMessage::FileReject { file_id: file_id.clone() })
        .await;

    let Event::TransferCompleted { direction, .. } =
        next_matching(&mut events, |e| {
            matches!(e, Event::TransferCompleted { .. } | Event::TransferCancelled { .. })
        })
        .await
    else {
        panic!("the reject cancelled an accepted transfer");
    };
    assert_eq!(direction, peerdrop_core::Direction::Send);

    let sent: Vec<u64> = channel
        .messages()
        .into_iter()
        .filter_map(|message| match message {
            ControlMessage::Chunk { chunk_index, .. } => Some(chunk_index),
            _ => None,
        })
        .collect();
    assert_eq!(sent, (0..20).collect::<Vec<_>>());
}

// ============ Scenario D: open channel without liveness ============

#[tokio::test]
async fn test_unanswered_probe_enters_retry_path() {
    let mut config = fast_config();
    config.peer.encryption = false;
    config.peer.probe_timeout_ms = 300;

    let room = RoomFixture::new();
    // Everything bob sends to alice vanishes; the channel itself still opens
    room.network
        .set_blackhole(&PeerId::from("bob"), &PeerId::from("alice"), true)
        .await;
    let mut alice = room.join("alice", config.clone()).await;
    let bob = room.join("bob", config).await;

    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let event = tokio::time::timeout_at(deadline, alice.events.recv())
            .await
            .expect("alice never gave up on the silent channel")
            .expect("event stream closed");
        if let Event::PeerStateChanged { peer, state } = event {
            if peer == bob.id {
                seen.push(state);
                if state == PeerState::Disconnected {
                    break;
                }
            }
        }
    }
    assert!(seen.contains(&PeerState::Connecting));
    assert!(!seen.contains(&PeerState::Connected), "states: {seen:?}");

    // The session keeps retrying while bob stays in the room
    let retried = wait_until(WAIT, || async {
        alice
            .registry
            .peer_state(&bob.id)
            .is_some_and(PeerState::is_negotiating)
    })
    .await;
    assert!(retried);

    alice.registry.shutdown().await;
    bob.registry.shutdown().await;
}

// ============ Scenario E: concurrency limit ============

#[tokio::test]
async fn test_fourth_concurrent_send_is_rejected() {
    let config = TransferConfig {
        max_concurrent_transfers: 3,
        ..TransferConfig::default()
    };
    let (manager, _events) = manager(config);
    connect(&manager, "receiver").await;

    for i in 0..3u8 {
        manager
            .send_file(Arc::new(MemorySource::new(vec![i; 500])), format!("f{i}"), "")
            .await
            .unwrap();
    }
    let fourth = manager
        .send_file(Arc::new(MemorySource::new(vec![9; 500])), "f3", "")
        .await;
    assert!(matches!(fourth, Err(Error::CapacityExceeded(_))));
    assert_eq!(manager.transfers().await.len(), 3);
    assert_eq!(manager.active_count().await, 3);
}
