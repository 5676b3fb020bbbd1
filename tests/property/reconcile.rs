#![allow(clippy::unwrap_used, clippy::cast_possible_truncation)]

//! Property tests for the client reconciliation store.
//!
//! 1. Each optimistic send settles at most once: whichever of confirm/fail
//!    lands first wins and the other is refused.
//! 2. The read flag never goes back to unread, whatever order receipts,
//!    echoes, and duplicate deliveries arrive in.
//! 3. Unread counts in summaries match the incoming messages not yet read.

use courier::state::{ClientStore, DeliveryState, Ingested, Transition};
use courier_proto::message::{Identity, Message, MessageId, Timestamp};
use proptest::prelude::*;

const SENDS: usize = 4;

#[derive(Debug, Clone, Copy)]
enum Op {
    Confirm(usize),
    Fail(usize),
    Receipt(usize),
    Echo(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..SENDS).prop_map(Op::Confirm),
        (0..SENDS).prop_map(Op::Fail),
        (0..SENDS).prop_map(Op::Receipt),
        (0..SENDS).prop_map(Op::Echo),
    ]
}

proptest! {
    #[test]
    fn sends_settle_once_and_read_is_monotonic(ops in prop::collection::vec(op(), 0..48)) {
        let local = Identity::new("alice");
        let bob = Identity::new("bob");
        let mut store = ClientStore::new(local.clone());

        let provisional: Vec<MessageId> = (0..SENDS)
            .map(|i| store.begin_send(&bob, &format!("m{i}")).unwrap())
            .collect();
        let canonical: Vec<MessageId> = (0..SENDS).map(|_| MessageId::new()).collect();
        let mut settled: Vec<Option<DeliveryState>> = vec![None; SENDS];
        let mut read = vec![false; SENDS];

        for op in ops {
            match op {
                Op::Confirm(i) => {
                    let t = store.confirm(provisional[i], canonical[i], Timestamp::from_millis(1_000 + i as u64));
                    if settled[i].is_none() {
                        prop_assert_eq!(t, Transition::Applied);
                        settled[i] = Some(DeliveryState::Sent);
                    } else {
                        prop_assert_ne!(t, Transition::Applied);
                    }
                }
                Op::Fail(i) => {
                    let t = store.fail(provisional[i], "timed out");
                    if settled[i].is_none() {
                        prop_assert_eq!(t, Transition::Applied);
                        settled[i] = Some(DeliveryState::Failed);
                    } else {
                        prop_assert_ne!(t, Transition::Applied);
                    }
                }
                Op::Receipt(i) => {
                    let id = if settled[i] == Some(DeliveryState::Sent) { canonical[i] } else { provisional[i] };
                    let changed = store.apply_read_receipt(&id);
                    prop_assert_eq!(changed, !read[i]);
                    read[i] = true;
                }
                Op::Echo(i) => {
                    // Echoes carry the canonical id, so they only match a confirmed send.
                    if settled[i] != Some(DeliveryState::Sent) {
                        continue;
                    }
                    let echo = Message {
                        id: canonical[i],
                        sender: local.clone(),
                        receiver: bob.clone(),
                        body: format!("m{i}"),
                        sent_at: Timestamp::from_millis(1_000 + i as u64),
                        read: false,
                    };
                    prop_assert_eq!(store.ingest(echo), Ingested::Duplicate);
                }
            }
        }

        prop_assert_eq!(store.conversation(&bob).len(), SENDS);
        for i in 0..SENDS {
            let id = if settled[i] == Some(DeliveryState::Sent) { canonical[i] } else { provisional[i] };
            let entry = store.message(&id).unwrap();
            prop_assert_eq!(entry.state, settled[i].unwrap_or(DeliveryState::Pending));
            prop_assert_eq!(entry.message.read, read[i]);
            prop_assert!(entry.is_own());
        }
    }

    #[test]
    fn unread_count_tracks_incoming(
        deliveries in prop::collection::vec((0usize..8, any::<bool>()), 0..32),
        mark_at in 0usize..32,
    ) {
        let local = Identity::new("bob");
        let alice = Identity::new("alice");
        let mut store = ClientStore::new(local.clone());
        let ids: Vec<MessageId> = (0..8).map(|_| MessageId::new()).collect();
        let mut known = std::collections::HashSet::new();
        let mut marked = std::collections::HashSet::new();

        for (step, (i, flag)) in deliveries.into_iter().enumerate() {
            if step == mark_at {
                for id in store.mark_conversation_read(&alice) {
                    marked.insert(id);
                }
            }
            let incoming = Message {
                id: ids[i],
                sender: alice.clone(),
                receiver: local.clone(),
                body: format!("m{i}"),
                sent_at: Timestamp::from_millis(i as u64),
                read: flag,
            };
            let outcome = store.ingest(incoming);
            prop_assert_eq!(outcome == Ingested::Inserted, known.insert(ids[i]));
            if flag {
                marked.insert(ids[i]);
            }
        }

        let unread = known.iter().filter(|id| !marked.contains(id)).count();
        let summaries = store.summaries();
        if known.is_empty() {
            prop_assert!(summaries.is_empty());
        } else {
            prop_assert_eq!(summaries.len(), 1);
            prop_assert_eq!(summaries[0].unread, unread);
            prop_assert_eq!(&summaries[0].correspondent, &alice);
        }
    }
}
