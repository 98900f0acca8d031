use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use folio_core::{Content, ContentMap, Direction, DocumentState, Operation, StructureNode};
use serde_json::json;

/// A flat page of `n` text blocks, every tenth one holding two children.
fn page(n: usize) -> DocumentState {
    let mut state = DocumentState::with_history(StructureNode::root(), ContentMap::new());
    let mut previous: Option<String> = None;
    for i in 0..n {
        let id = format!("block-{i}");
        let mut data = Content::new();
        data.insert("type".into(), json!("text"));
        data.insert("textContent".into(), json!(format!("paragraph {i} with some words")));
        state.insert_block(previous.as_deref(), id.clone(), data, Direction::After);
        if i % 10 == 0 {
            for c in 0..2 {
                state.insert_block(Some(&id), format!("{id}-{c}"), Content::new(), Direction::Inside);
            }
        }
        previous = Some(id);
    }
    state
}

fn bench_consistency_hash(c: &mut Criterion) {
    let state = page(500);
    c.bench_function("consistency_hash_500_blocks", |b| {
        b.iter(|| black_box(state.consistency_hash()))
    });
}

fn bench_edit_apply(c: &mut Criterion) {
    let mut state = page(500);
    let mut ts = 0u64;
    c.bench_function("edit_apply_with_history", |b| {
        b.iter(|| {
            ts += 2_000;
            let mut data = Content::new();
            data.insert("textContent".into(), json!("edited"));
            state.perform_operation(Operation::edit("block-250", data, ts));
        })
    });
}

fn bench_delete_undo(c: &mut Criterion) {
    let mut state = page(500);
    c.bench_function("delete_then_undo_subtree", |b| {
        b.iter(|| {
            state.perform_operation(Operation::delete("block-250"));
            black_box(state.undo());
        })
    });
}

fn bench_operation_decode(c: &mut Criterion) {
    let mut state = page(50);
    let mut op = Operation::delete("block-20");
    op.apply(&mut state);
    let wire = serde_json::to_string(&op).unwrap_or_default();

    c.bench_function("operation_decode_delete", |b| {
        b.iter(|| black_box(serde_json::from_str::<Operation>(black_box(&wire)).ok()))
    });
}

criterion_group!(
    benches,
    bench_consistency_hash,
    bench_edit_apply,
    bench_delete_undo,
    bench_operation_decode,
);
criterion_main!(benches);
