//! Property-based tests for peerdrop
//!
//! Uses proptest to verify transfer invariants across large input spaces.

use proptest::prelude::*;

// ============================================================================
// Chunking Properties
// ============================================================================

mod chunking_properties {
    use super::*;
    use peerdrop_core::transfer::expected_chunk_len;

    proptest! {
        /// Chunk lengths cover the file exactly; only the last may be short
        #[test]
        fn chunks_cover_file(file_size in 1u64..200_000, chunk_size in 1usize..20_000) {
            let total = file_size.div_ceil(chunk_size as u64);
            let mut covered = 0u64;
            for index in 0..total {
                let len = expected_chunk_len(file_size, chunk_size, index)
                    .expect("index within range");
                prop_assert!(len > 0);
                if index + 1 < total {
                    prop_assert_eq!(len, chunk_size);
                }
                covered += len as u64;
            }
            prop_assert_eq!(covered, file_size);
            prop_assert_eq!(expected_chunk_len(file_size, chunk_size, total), None);
        }
    }
}

// ============================================================================
// Reassembly Properties
// ============================================================================

mod reassembly_properties {
    use super::*;
    use peerdrop_core::transfer::{ChunkOutcome, TransferSession};
    use peerdrop_core::{FileOffer, TransferConfig, TransferState};
    use peerdrop_crypto::digest_hex;
    use peerdrop_discovery::PeerId;

    fn receive_session(data: &[u8], chunk_size: usize) -> TransferSession {
        let offer = FileOffer {
            file_id: "prop".into(),
            file_name: "prop.bin".into(),
            file_type: String::new(),
            file_size: data.len() as u64,
            total_chunks: (data.len() as u64).div_ceil(chunk_size as u64),
            chunk_size,
            hash: Some(digest_hex(data)),
            sender_id: PeerId::from("sender"),
        };
        let mut session = TransferSession::new_receive(offer, &TransferConfig::default());
        session.accept();
        session
    }

    /// File bytes, chunk size and a delivery order (a shuffled index list)
    fn delivery() -> impl Strategy<Value = (Vec<u8>, usize, Vec<u64>)> {
        (prop::collection::vec(any::<u8>(), 1..4_000), 1usize..700).prop_flat_map(
            |(data, chunk_size)| {
                let total = (data.len() as u64).div_ceil(chunk_size as u64);
                let order = Just((0..total).collect::<Vec<u64>>()).prop_shuffle();
                (Just(data), Just(chunk_size), order)
            },
        )
    }

    proptest! {
        /// Any delivery order, with duplicates, reassembles the original bytes
        #[test]
        fn any_order_reassembles((data, chunk_size, order) in delivery(), dup in any::<prop::sample::Index>()) {
            let mut session = receive_session(&data, chunk_size);
            let chunks: Vec<&[u8]> = data.chunks(chunk_size).collect();
            let replay = order[dup.index(order.len())];

            for (n, &index) in order.iter().enumerate() {
                let outcome = session
                    .store_chunk(index, chunks[index as usize].to_vec())
                    .expect("valid chunk");
                prop_assert_eq!(outcome, ChunkOutcome::Stored { complete: n + 1 == order.len() });

                if index == replay {
                    let again = session
                        .store_chunk(index, chunks[index as usize].to_vec())
                        .expect("valid chunk");
                    prop_assert_eq!(again, ChunkOutcome::Duplicate);
                }
            }

            prop_assert!(session.missing_chunks().is_empty());
            prop_assert_eq!(session.assemble().expect("digest matches"), data);
            prop_assert_eq!(session.state(), TransferState::Completed);
        }

        /// The missing list is exactly the complement of what was stored
        #[test]
        fn missing_is_complement((data, chunk_size, order) in delivery(), keep in 0.0f64..1.0) {
            let mut session = receive_session(&data, chunk_size);
            let chunks: Vec<&[u8]> = data.chunks(chunk_size).collect();
            let stored = ((order.len() as f64) * keep) as usize;

            for &index in &order[..stored] {
                session
                    .store_chunk(index, chunks[index as usize].to_vec())
                    .expect("valid chunk");
            }

            let mut expected: Vec<u64> = order[stored..].to_vec();
            expected.sort_unstable();
            prop_assert_eq!(session.missing_chunks(), expected);
            prop_assert_eq!(session.received_count(), stored as u64);
        }

        /// A chunk whose length does not match its index is refused
        #[test]
        fn wrong_length_is_refused((data, chunk_size, _order) in delivery(), extra in 1usize..16) {
            let mut session = receive_session(&data, chunk_size);
            let last = session.total_chunks() - 1;
            let len = data.chunks(chunk_size).last().map_or(0, <[u8]>::len);

            prop_assert!(session.store_chunk(last, vec![0; len + extra]).is_err());
            prop_assert!(session.store_chunk(last + 1, vec![0; chunk_size]).is_err());
            prop_assert_eq!(session.received_count(), 0);
        }
    }
}

// ============================================================================
// Wire Protocol Properties
// ============================================================================

mod protocol_properties {
    use super::*;
    use peerdrop_core::ControlMessage;
    use peerdrop_core::protocol::WireMessage;

    proptest! {
        /// Parsing arbitrary text never panics
        #[test]
        fn parse_never_panics(text in ".{0,256}") {
            let _ = WireMessage::parse(&text);
        }

        /// Unknown message types are tolerated rather than rejected
        #[test]
        fn unknown_types_are_tolerated(kind in "[a-z]{3,12}-x") {
            let text = format!(r#"{{"type":"{kind}","payload":1}}"#);
            let parsed = WireMessage::parse(&text);
            prop_assert!(matches!(parsed, Ok(WireMessage::Unknown(k)) if k == kind));
        }

        /// Resend requests keep every index in order
        #[test]
        fn resend_request_keeps_indices(missing in prop::collection::vec(any::<u64>(), 0..64)) {
            let message = ControlMessage::ResendRequest {
                file_id: "f".into(),
                missing: missing.clone(),
            };
            let text = WireMessage::encode(&message, None).expect("encode");
            let parsed = WireMessage::parse(&text).expect("parse");
            let preserved = matches!(
                parsed,
                WireMessage::Plain(ControlMessage::ResendRequest { missing: ref m, .. }) if *m == missing
            );
            prop_assert!(preserved);
        }
    }
}

// ============================================================================
// Backoff Properties
// ============================================================================

mod backoff_properties {
    use super::*;
    use peerdrop_core::peer::Backoff;
    use std::time::Duration;

    proptest! {
        /// Jittered delays never exceed the cap and attempts stay bounded
        #[test]
        fn jittered_delay_is_capped(base in 1u64..5_000, extra in 0u64..20_000, attempt in 0u32..40) {
            let cap = Duration::from_millis(base + extra);
            let backoff = Backoff::new(Duration::from_millis(base), cap, 3, true);
            prop_assert!(backoff.delay(attempt) <= cap);
            prop_assert!(backoff.allows(2));
            prop_assert!(!backoff.allows(3));
        }
    }
}
