use criterion::{black_box, criterion_group, criterion_main, Criterion};
use docsync_core::{Cell, SharedDocument};

fn bench_local_insert(c: &mut Criterion) {
    let doc = SharedDocument::new("bench");
    c.bench_function("local_insert_char", |b| {
        b.iter(|| {
            let len = doc.source_len();
            doc.insert_text(black_box(len), black_box("x")).unwrap();
        })
    });
}

fn bench_apply_remote_delta(c: &mut Criterion) {
    let source = SharedDocument::new("bench");
    source.insert_text(0, &"lorem ipsum ".repeat(64)).unwrap();
    let update = source.snapshot();

    c.bench_function("apply_snapshot_768B_text", |b| {
        b.iter(|| {
            let replica = SharedDocument::new("bench");
            replica.apply_update(black_box(&update)).unwrap();
        })
    });
}

fn bench_encode_diff(c: &mut Criterion) {
    let doc = SharedDocument::new("bench");
    for i in 0..100 {
        doc.push_cell(&Cell::code(format!("x = {i}"))).unwrap();
    }
    let peer = SharedDocument::new("bench");
    peer.apply_update(&doc.snapshot()).unwrap();
    doc.push_cell(&Cell::markdown("tail")).unwrap();
    let sv = peer.state_vector();

    c.bench_function("encode_diff_100_cells", |b| {
        b.iter(|| black_box(doc.encode_state_as_update(Some(black_box(&sv))).unwrap()))
    });
}

criterion_group!(benches, bench_local_insert, bench_apply_remote_delta, bench_encode_diff);
criterion_main!(benches);
