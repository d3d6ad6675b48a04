#![no_main]

use collab_crdt::{ChatEntry, OpId, Operation, Payload, Replica, TextOp};
use libfuzzer_sys::fuzz_target;
use std::time::Duration;

fn id(replica: u8, counter: u8) -> OpId {
    OpId::new(u64::from(counter.max(1)), u64::from(replica % 4) + 1)
}

fuzz_target!(|data: &[u8]| {
    let mut ops = Vec::new();
    for chunk in data.chunks_exact(6) {
        let own = id(chunk[0], chunk[1]);
        let payload = match chunk[2] % 3 {
            0 => Payload::Text(TextOp::Insert {
                id: own,
                value: char::from(b'a' + chunk[3] % 26),
                origin_left: (chunk[4] > 0).then(|| id(chunk[4], chunk[5])),
                origin_right: None,
            }),
            1 => Payload::Text(TextOp::Delete {
                id: own,
                target: id(chunk[4], chunk[5]),
            }),
            _ => Payload::Chat(ChatEntry {
                author: "fuzz".into(),
                color: "#000000".into(),
                text: "m".into(),
                stamp: own,
                wall_clock: u64::from(chunk[3]),
            }),
        };
        ops.push(Operation {
            prev: u64::from(chunk[4] % 8),
            payload,
        });
    }
    let mut replica = Replica::new(99, Duration::from_secs(30));
    let _ = replica.apply_remote_ops(ops);
    let _ = replica.text().visible_text();
    let _ = replica.snapshot();
});
