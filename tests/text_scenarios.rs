use collab_crdt::{CausalClock, OpId, TextChange, TextDocument, TextError, TextOp};

fn typed(replica: u64, text: &str) -> Vec<TextOp> {
    let mut doc = TextDocument::new();
    let mut clock = CausalClock::new(replica);
    doc.insert_str(&mut clock, 0, text).unwrap()
}

fn apply_all(doc: &mut TextDocument, ops: &[TextOp]) {
    for op in ops {
        let _ = doc.apply_remote(op.clone());
    }
}

#[test]
fn test_concurrent_inserts_at_start_order_by_id() {
    let hi = typed(1, "hi");
    let yo = typed(2, "yo");

    let mut a = TextDocument::new();
    apply_all(&mut a, &hi);
    apply_all(&mut a, &yo);

    let mut b = TextDocument::new();
    apply_all(&mut b, &yo);
    apply_all(&mut b, &hi);

    assert_eq!(a.visible_text(), "yohi");
    assert_eq!(b.visible_text(), "yohi");
}

#[test]
fn test_insert_with_missing_origin_is_parked_then_released() {
    let ops = typed(1, "abc");
    let mut doc = TextDocument::new();

    let err = doc.apply_remote(ops[2].clone()).unwrap_err();
    assert!(matches!(err, TextError::UnresolvedDependency { missing, .. } if missing == ops[1].id()));
    let err = doc.apply_remote(ops[1].clone()).unwrap_err();
    assert!(matches!(err, TextError::UnresolvedDependency { .. }));
    assert_eq!(doc.visible_text(), "");
    assert_eq!(doc.pending_count(), 2);

    let effect = doc.apply_remote(ops[0].clone()).unwrap();
    assert_eq!(effect.changes.len(), 3);
    assert_eq!(doc.visible_text(), "abc");
    assert_eq!(doc.pending_count(), 0);
}

#[test]
fn test_long_reverse_chain_resolves() {
    let text: String = std::iter::repeat_n('x', 2_000).collect();
    let ops = typed(4, &text);
    let mut doc = TextDocument::new();
    for op in ops.iter().rev() {
        let _ = doc.apply_remote(op.clone());
    }
    assert_eq!(doc.visible_text(), text);
    assert_eq!(doc.pending_count(), 0);
}

#[test]
fn test_delete_before_insert_is_deferred() {
    let mut source = TextDocument::new();
    let mut clock = CausalClock::new(1);
    let inserts = source.insert_str(&mut clock, 0, "ab").unwrap();
    let deletes = source.delete_range(&mut clock, 0, 1).unwrap();

    let mut doc = TextDocument::new();
    let effect = doc.apply_remote(deletes[0].clone()).unwrap();
    assert!(effect.deferred);
    assert!(effect.changes.is_empty());

    apply_all(&mut doc, &inserts);
    assert_eq!(doc.visible_text(), "b");
    assert_eq!(doc.visible_text(), source.visible_text());
}

#[test]
fn test_duplicate_delivery_is_a_noop() {
    let ops = typed(1, "ok");
    let mut doc = TextDocument::new();
    apply_all(&mut doc, &ops);
    for op in &ops {
        let effect = doc.apply_remote(op.clone()).unwrap();
        assert!(effect.is_noop());
    }
    assert_eq!(doc.visible_text(), "ok");
}

#[test]
fn test_concurrent_delete_of_same_character() {
    let base = typed(1, "abc");
    let mut a = TextDocument::new();
    let mut b = TextDocument::new();
    apply_all(&mut a, &base);
    apply_all(&mut b, &base);

    let mut clock_a = CausalClock::new(2);
    let mut clock_b = CausalClock::new(3);
    for op in &base {
        clock_a.observe(op.id());
        clock_b.observe(op.id());
    }
    let from_a = a.delete_range(&mut clock_a, 1, 1).unwrap();
    let from_b = b.delete_range(&mut clock_b, 1, 1).unwrap();

    apply_all(&mut a, &from_b);
    apply_all(&mut b, &from_a);
    assert_eq!(a.visible_text(), "ac");
    assert_eq!(b.visible_text(), "ac");
}

#[test]
fn test_insert_next_to_deleted_character() {
    let base = typed(1, "ab");
    let mut a = TextDocument::new();
    let mut b = TextDocument::new();
    apply_all(&mut a, &base);
    apply_all(&mut b, &base);

    let mut clock_a = CausalClock::new(2);
    let mut clock_b = CausalClock::new(3);
    for op in &base {
        clock_a.observe(op.id());
        clock_b.observe(op.id());
    }
    let deleted = a.delete_range(&mut clock_a, 0, 1).unwrap();
    let inserted = b.insert_str(&mut clock_b, 1, "X").unwrap();

    apply_all(&mut a, &inserted);
    apply_all(&mut b, &deleted);
    assert_eq!(a.visible_text(), "Xb");
    assert_eq!(b.visible_text(), "Xb");
}

#[test]
fn test_remote_changes_report_visible_indices() {
    let base = typed(1, "ac");
    let mut doc = TextDocument::new();
    apply_all(&mut doc, &base);

    let mut writer = TextDocument::new();
    apply_all(&mut writer, &base);
    let mut clock = CausalClock::new(2);
    clock.observe(base[1].id());
    let op = writer.local_insert(&mut clock, 1, 'b').unwrap();

    let effect = doc.apply_remote(op).unwrap();
    assert_eq!(
        effect.changes,
        vec![TextChange::Inserted {
            index: 1,
            value: 'b'
        }]
    );
}

#[test]
fn test_origin_not_older_than_insert_is_rejected() {
    let mut doc = TextDocument::new();
    let op = TextOp::Insert {
        id: OpId::new(1, 1),
        value: 'x',
        origin_left: Some(OpId::new(5, 2)),
        origin_right: None,
    };
    let err = doc.apply_remote(op).unwrap_err();
    assert!(matches!(err, TextError::CausalityViolation { .. }));
    assert!(doc.is_empty());
    assert_eq!(doc.pending_count(), 0);
}

#[test]
fn test_out_of_bounds_local_edits() {
    let mut doc = TextDocument::new();
    let mut clock = CausalClock::new(1);
    assert!(matches!(
        doc.local_insert(&mut clock, 1, 'x'),
        Err(TextError::PositionOutOfBounds { position: 1, len: 0 })
    ));
    doc.insert_str(&mut clock, 0, "ab").unwrap();
    assert!(doc.delete_range(&mut clock, 1, 5).is_err());
    assert_eq!(doc.visible_text(), "ab");
}
