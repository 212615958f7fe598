use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use folio_collab::{
    html, AwarenessConfig, AwarenessEntry, AwarenessStore, CursorRange, DocumentReplica, RoomId,
    TreeMutation, WireMessage,
};

fn room() -> RoomId {
    RoomId::for_section("doc123", "summary_table").unwrap()
}

fn typing_delta(replica: &Arc<DocumentReplica>, at: u32) -> Vec<u8> {
    let (tx, rx) = std::sync::mpsc::channel();
    let _sub = replica.observe(move |event| {
        let _ = tx.send(event.delta.to_vec());
    });
    replica
        .apply_local_change(&[TreeMutation::EditText {
            text: vec![0, 0],
            index: at,
            insert: "x".into(),
            marks: vec![],
        }])
        .unwrap();
    rx.recv().unwrap()
}

fn bench_local_keystroke(c: &mut Criterion) {
    let replica = DocumentReplica::new(room());
    replica.seed_html("<p>start</p>").unwrap();
    let mut at = 5u32;

    c.bench_function("local_keystroke", |b| {
        b.iter(|| {
            replica
                .apply_local_change(black_box(&[TreeMutation::EditText {
                    text: vec![0, 0],
                    index: at,
                    insert: "x".into(),
                    marks: vec![],
                }]))
                .unwrap();
            at += 1;
        })
    });
}

fn bench_remote_merge(c: &mut Criterion) {
    let source = DocumentReplica::new(room());
    source.seed_html("<p>start</p>").unwrap();
    let seed = source.encode_state();
    let deltas: Vec<Vec<u8>> = (0..100).map(|i| typing_delta(&source, 5 + i)).collect();

    c.bench_function("remote_merge_100_keystrokes", |b| {
        b.iter(|| {
            let target = DocumentReplica::new(room());
            target.apply_remote_delta(&seed).unwrap();
            for delta in &deltas {
                target.apply_remote_delta(black_box(delta)).unwrap();
            }
            black_box(target.to_html());
        })
    });
}

fn bench_handshake_diff(c: &mut Criterion) {
    let ahead = DocumentReplica::new(room());
    ahead.seed_html("<h2>Results</h2><p>Some <strong>bold</strong> findings.</p>").unwrap();
    let behind = DocumentReplica::new(room());
    for i in 0..50 {
        typing_delta(&ahead, 5 + i);
    }
    let state_vector = behind.state_vector();

    c.bench_function("handshake_diff_since", |b| {
        b.iter(|| black_box(ahead.diff_since(black_box(&state_vector)).unwrap()))
    });
}

fn bench_doc_update_codec(c: &mut Criterion) {
    let message = WireMessage::doc_update(&room(), &[0u8; 64]);
    let encoded = message.encode().unwrap();

    c.bench_function("doc_update_encode_64B", |b| {
        b.iter(|| black_box(black_box(&message).encode().unwrap()))
    });
    c.bench_function("doc_update_decode_64B", |b| {
        b.iter(|| black_box(WireMessage::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_awareness_codec(c: &mut Criterion) {
    let mut store = AwarenessStore::new("alice", AwarenessConfig::default());
    store.set_local_cursor(Some(CursorRange { anchor: 3, head: 17 }));
    let entries: Vec<AwarenessEntry> = vec![store.local_update()];
    let message = WireMessage::awareness_update(&room(), entries);
    let encoded = message.encode().unwrap();

    c.bench_function("awareness_update_roundtrip", |b| {
        b.iter(|| {
            let bytes = black_box(&message).encode().unwrap();
            black_box(WireMessage::decode(&bytes).unwrap());
        })
    });
    c.bench_function("awareness_apply_remote", |b| {
        let message = WireMessage::decode(&encoded).unwrap();
        let WireMessage::AwarenessUpdate { states, .. } = message else {
            unreachable!()
        };
        b.iter(|| {
            let mut peer = AwarenessStore::new("bob", AwarenessConfig::default());
            black_box(peer.apply_remote(black_box(&states)));
        })
    });
}

fn bench_html_parse(c: &mut Criterion) {
    let content = "<h2>Summary</h2><p>The <em>first</em> result, see <a href=\"#t1\">Table 1</a>.</p>\
                   <ul><li>one</li><li>two &amp; three</li></ul>";

    c.bench_function("html_parse_section", |b| {
        b.iter(|| black_box(html::parse(black_box(content)).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_local_keystroke,
    bench_remote_merge,
    bench_handshake_diff,
    bench_doc_update_codec,
    bench_awareness_codec,
    bench_html_parse,
);
criterion_main!(benches);
