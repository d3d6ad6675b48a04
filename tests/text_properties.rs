use collab_crdt::{CausalClock, TextDocument, TextOp};
use collab_crdt_naive_oracle::Sequence as OracleSequence;
use proptest::prelude::*;
use proptest::sample::Index;

mod proptest_config;

const PEERS: usize = 3;

#[derive(Debug, Clone)]
enum Step {
    Insert { peer: usize, at: Index, value: char },
    Delete { peer: usize, at: Index },
    Sync { from: usize, to: usize },
}

fn steps() -> impl Strategy<Value = Vec<Step>> {
    let step = prop_oneof![
        4 => (0..PEERS, any::<Index>(), prop::char::range('a', 'f'))
            .prop_map(|(peer, at, value)| Step::Insert { peer, at, value }),
        2 => (0..PEERS, any::<Index>()).prop_map(|(peer, at)| Step::Delete { peer, at }),
        1 => (0..PEERS, 0..PEERS).prop_map(|(from, to)| Step::Sync { from, to }),
    ];
    prop::collection::vec(step, 0..60)
}

struct Peer {
    doc: TextDocument,
    clock: CausalClock,
}

fn deliver(peer: &mut Peer, ops: impl IntoIterator<Item = TextOp>) {
    for op in ops {
        peer.clock.observe(op.id());
        let _ = peer.doc.apply_remote(op);
    }
}

fn run(steps: &[Step]) -> Vec<Peer> {
    let mut peers: Vec<Peer> = (1..=PEERS as u64)
        .map(|id| Peer {
            doc: TextDocument::new(),
            clock: CausalClock::new(id),
        })
        .collect();
    for step in steps {
        match step {
            Step::Insert { peer, at, value } => {
                let Peer { doc, clock } = &mut peers[*peer];
                let position = at.index(doc.len() + 1);
                doc.local_insert(clock, position, *value).unwrap();
            }
            Step::Delete { peer, at } => {
                let Peer { doc, clock } = &mut peers[*peer];
                if !doc.is_empty() {
                    let position = at.index(doc.len());
                    doc.local_delete(clock, position).unwrap();
                }
            }
            Step::Sync { from, to } => {
                if from != to {
                    let ops = peers[*from].doc.ops();
                    deliver(&mut peers[*to], ops);
                }
            }
        }
    }
    peers
}

fn all_ops(peers: &[Peer]) -> Vec<TextOp> {
    let mut ops: Vec<TextOp> = peers.iter().flat_map(|peer| peer.doc.ops()).collect();
    ops.sort_by_key(TextOp::id);
    ops.dedup_by_key(|op| op.id());
    ops
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(proptest_config::cases()))]

    #[test]
    fn prop_full_mesh_converges(steps in steps()) {
        let mut peers = run(&steps);
        let ops = all_ops(&peers);
        for peer in &mut peers {
            deliver(peer, ops.clone());
        }
        let expected = peers[0].doc.visible_text();
        for peer in &peers {
            prop_assert_eq!(peer.doc.visible_text(), expected.clone());
            prop_assert_eq!(peer.doc.pending_count(), 0);
        }
    }

    #[test]
    fn prop_matches_oracle(steps in steps()) {
        let peers = run(&steps);
        let ops = all_ops(&peers);

        let mut oracle = OracleSequence::new();
        let mut doc = TextDocument::new();
        for op in &ops {
            oracle.apply(op.clone());
            doc.apply_remote(op.clone()).unwrap();
        }
        prop_assert_eq!(doc.visible_text(), oracle.text());
    }

    #[test]
    fn prop_delivery_order_is_irrelevant(steps in steps(), seed in any::<u64>()) {
        let peers = run(&steps);
        let ops = all_ops(&peers);

        let mut in_order = TextDocument::new();
        for op in &ops {
            let _ = in_order.apply_remote(op.clone());
        }

        let mut reversed = TextDocument::new();
        for op in ops.iter().rev() {
            let _ = reversed.apply_remote(op.clone());
        }

        let mut rotated_ops = ops.clone();
        if !rotated_ops.is_empty() {
            let mid = (seed as usize) % rotated_ops.len();
            rotated_ops.rotate_left(mid);
        }
        let mut rotated = TextDocument::new();
        for op in rotated_ops {
            let _ = rotated.apply_remote(op);
        }

        prop_assert_eq!(reversed.visible_text(), in_order.visible_text());
        prop_assert_eq!(rotated.visible_text(), in_order.visible_text());
        prop_assert_eq!(reversed.pending_count(), 0);
        prop_assert_eq!(rotated.pending_count(), 0);
    }

    #[test]
    fn prop_idempotence(steps in steps()) {
        let peers = run(&steps);
        let ops = all_ops(&peers);
        let mut once = TextDocument::new();
        let mut twice = TextDocument::new();
        for op in &ops {
            let _ = once.apply_remote(op.clone());
        }
        for op in &ops {
            let _ = twice.apply_remote(op.clone());
            let _ = twice.apply_remote(op.clone());
        }
        prop_assert_eq!(once.visible_text(), twice.visible_text());
        prop_assert_eq!(once.state_vector(), twice.state_vector());
    }

    #[test]
    fn prop_snapshot_restores_visible_text(steps in steps()) {
        let peers = run(&steps);
        for peer in &peers {
            let mut restored = TextDocument::new();
            restored.load_snapshot(peer.doc.snapshot()).unwrap();
            prop_assert_eq!(restored.visible_text(), peer.doc.visible_text());
            prop_assert_eq!(restored.state_vector(), peer.doc.state_vector());
        }
    }

    #[test]
    fn prop_local_edits_match_plain_string(
        edits in prop::collection::vec((any::<bool>(), any::<Index>(), prop::char::range('a', 'z')), 0..80)
    ) {
        let mut doc = TextDocument::new();
        let mut clock = CausalClock::new(7);
        let mut plain: Vec<char> = Vec::new();
        for (insert, at, value) in edits {
            if insert || plain.is_empty() {
                let position = at.index(plain.len() + 1);
                doc.local_insert(&mut clock, position, value).unwrap();
                plain.insert(position, value);
            } else {
                let position = at.index(plain.len());
                doc.local_delete(&mut clock, position).unwrap();
                plain.remove(position);
            }
        }
        prop_assert_eq!(doc.visible_text(), plain.into_iter().collect::<String>());
    }
}
