use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use collaborator::extension::{apply_update, encode_state, Extension};
use collaborator::{
    BlobMetadata, BlobStore, MeasureContext, MemoryBlobStore, MemoryPlatform, RocksBlobStore,
    SessionContext, StorageConfiguration, StorageExtension, StoreConfig, SyncMessage, Token,
    TokenIssuer,
};
use criterion::{criterion_group, criterion_main, Criterion};
use uuid::Uuid;
use yrs::{Doc, Text, Transact, WriteTxn};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn doc_with_paragraphs(count: usize) -> Doc {
    let doc = Doc::new();
    {
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text("content");
        for i in 0..count {
            text.insert(&mut txn, 0, &format!("Paragraph {i} of a shared document.\n"));
        }
    }
    doc
}

fn extension(blobs: Arc<dyn BlobStore>, platform: &MemoryPlatform) -> StorageExtension {
    StorageExtension::new(StorageConfiguration {
        measure: MeasureContext::new("bench"),
        blobs,
        platform: Arc::new(platform.clone()),
        issuer: Arc::new(TokenIssuer::new("bench-secret", Duration::from_secs(60))),
        transactor_url: "ws://transactor".into(),
    })
}

fn context() -> SessionContext {
    SessionContext::new(Token::new("alice@example.com", "ws-1"))
}

// ─── Wire protocol ───────────────────────────────────────────────────────────

fn bench_update_encode(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let update = vec![0u8; 64];

    c.bench_function("update_encode_64B", |b| {
        b.iter(|| {
            let msg = SyncMessage::update(black_box(peer), "doc-1", black_box(update.clone()));
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let encoded = SyncMessage::update(Uuid::new_v4(), "doc-1", vec![0u8; 64])
        .encode()
        .unwrap();

    c.bench_function("update_decode_64B", |b| {
        b.iter(|| {
            black_box(SyncMessage::decode(black_box(&encoded)).unwrap());
        })
    });
}

// ─── Yrs state ───────────────────────────────────────────────────────────────

fn bench_encode_state_1000(c: &mut Criterion) {
    let doc = doc_with_paragraphs(1000);

    c.bench_function("encode_state_1000_paragraphs", |b| {
        b.iter(|| black_box(encode_state(black_box(&doc))))
    });
}

fn bench_apply_state_1000(c: &mut Criterion) {
    let state = encode_state(&doc_with_paragraphs(1000));

    c.bench_function("apply_state_1000_paragraphs", |b| {
        b.iter(|| {
            let doc = Doc::new();
            apply_update(&doc, black_box(&state)).unwrap();
            black_box(doc);
        })
    });
}

// ─── Extension ───────────────────────────────────────────────────────────────

fn bench_store_memory(c: &mut Criterion) {
    let rt = runtime();
    let platform = MemoryPlatform::new();
    platform.insert_attachment("doc-1");
    let ext = extension(Arc::new(MemoryBlobStore::new()), &platform);
    let doc = doc_with_paragraphs(100);
    let ctx = context();

    c.bench_function("store_document_memory_100", |b| {
        b.iter(|| {
            rt.block_on(ext.on_store_document("doc-1", &ctx, &doc)).unwrap();
        })
    });
}

fn bench_load_memory(c: &mut Criterion) {
    let rt = runtime();
    let blobs = Arc::new(MemoryBlobStore::new());
    let state = encode_state(&doc_with_paragraphs(100));
    rt.block_on(blobs.put("ws-1", "doc-1", &state, BlobMetadata::ydoc(state.len() as u64)))
        .unwrap();
    let ext = extension(blobs, &MemoryPlatform::new());
    let ctx = context();

    c.bench_function("load_document_memory_100", |b| {
        b.iter(|| black_box(rt.block_on(ext.on_load_document("doc-1", &ctx))))
    });
}

fn bench_store_load_rocks(c: &mut Criterion) {
    let rt = runtime();
    let dir = tempfile::tempdir().unwrap();
    let blobs = Arc::new(RocksBlobStore::open(StoreConfig::for_testing(dir.path())).unwrap());
    let ext = extension(blobs, &MemoryPlatform::new());
    let doc = doc_with_paragraphs(100);
    let ctx = context();

    c.bench_function("store_load_rocks_100", |b| {
        b.iter(|| {
            rt.block_on(async {
                ext.on_store_document("doc-1", &ctx, &doc).await.unwrap();
                black_box(ext.on_load_document("doc-1", &ctx).await);
            })
        })
    });
}

criterion_group!(
    benches,
    bench_update_encode,
    bench_update_decode,
    bench_encode_state_1000,
    bench_apply_state_1000,
    bench_store_memory,
    bench_load_memory,
    bench_store_load_rocks,
);

criterion_main!(benches);
