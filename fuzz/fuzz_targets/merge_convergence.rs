#![no_main]

//! Text operations generated by simulated replicas must converge whatever
//! order they are delivered in.

use collab_crdt::{CausalClock, TextDocument, TextOp};
use libfuzzer_sys::fuzz_target;

const PEERS: usize = 3;

/// Each three-byte chunk is an edit or a sync between two peers.
fn generate(data: &[u8]) -> Vec<TextOp> {
    let mut docs: Vec<(TextDocument, CausalClock)> = (1..=PEERS as u64)
        .map(|id| (TextDocument::new(), CausalClock::new(id)))
        .collect();
    for chunk in data.chunks_exact(3) {
        let peer = chunk[0] as usize % PEERS;
        match chunk[1] % 4 {
            0 | 1 => {
                let (doc, clock) = &mut docs[peer];
                let position = chunk[2] as usize % (doc.len() + 1);
                let _ = doc.local_insert(clock, position, char::from(b'a' + chunk[1] % 26));
            }
            2 => {
                let (doc, clock) = &mut docs[peer];
                if !doc.is_empty() {
                    let position = chunk[2] as usize % doc.len();
                    let _ = doc.local_delete(clock, position);
                }
            }
            _ => {
                let from = chunk[2] as usize % PEERS;
                if from != peer {
                    let ops = docs[from].0.ops();
                    let (doc, clock) = &mut docs[peer];
                    for op in ops {
                        clock.observe(op.id());
                        let _ = doc.apply_remote(op);
                    }
                }
            }
        }
    }
    let mut ops: Vec<TextOp> = docs.iter().flat_map(|(doc, _)| doc.ops()).collect();
    ops.sort_by_key(TextOp::id);
    ops.dedup_by_key(|op| op.id());
    ops
}

fn replay<'a>(ops: impl IntoIterator<Item = &'a TextOp>) -> TextDocument {
    let mut doc = TextDocument::new();
    for op in ops {
        let _ = doc.apply_remote(op.clone());
    }
    doc
}

fuzz_target!(|data: &[u8]| {
    let ops = generate(data);
    if ops.len() < 2 {
        return;
    }

    let forward = replay(&ops);
    let reverse = replay(ops.iter().rev());
    assert_eq!(forward.visible_text(), reverse.visible_text());

    let mut shuffled = ops.clone();
    for i in 0..shuffled.len() {
        let j = data[i % data.len()] as usize % shuffled.len();
        shuffled.swap(i, j);
    }
    let shuffled = replay(&shuffled);
    assert_eq!(forward.visible_text(), shuffled.visible_text());
    assert_eq!(shuffled.pending_count(), 0);
});
