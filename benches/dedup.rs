use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use hft_dedup::cnc::CNC_APP_MIN_WORDS;
use hft_dedup::{
    Cnc, DedupTile, FragMeta, Fseq, InLink, MCache, MonoClock, Step, TCache, TileConfig,
};
use std::sync::Arc;

const RING_DEPTH: usize = 4096;
const TCACHE_DEPTH: usize = 1 << 16;

fn fingerprint(k: u64) -> u64 {
    (k + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// Feeds one fragment per iteration and steps the tile until it has been
/// consumed. The only consumer acknowledges everything immediately.
fn bench_stream(c: &mut Criterion, name: &str, sig_of: fn(u64) -> u64) {
    let in_mcache = MCache::new(RING_DEPTH, 0);
    let out_mcache = MCache::new(RING_DEPTH, 0);
    let out_fseq = Arc::new(Fseq::new(0));
    let mut tile = match DedupTile::boot(
        Arc::new(Cnc::new(CNC_APP_MIN_WORDS)),
        vec![InLink::new(Arc::clone(&in_mcache), Arc::new(Fseq::new(0)))],
        TCache::new(TCACHE_DEPTH, 0).unwrap(),
        Arc::clone(&out_mcache),
        vec![Arc::clone(&out_fseq)],
        &TileConfig::default(),
        MonoClock,
    ) {
        Ok(tile) => tile,
        Err(err) => panic!("boot failed: {err}"),
    };

    let mut group = c.benchmark_group("dedup");
    group.throughput(Throughput::Elements(1));
    let mut k = 0u64;
    group.bench_function(name, |b| {
        b.iter(|| {
            out_fseq.update(tile.seq());
            in_mcache.publish(&FragMeta {
                seq: k,
                sig: sig_of(k),
                sz: 64,
                ..FragMeta::default()
            });
            k += 1;
            loop {
                match black_box(tile.step()) {
                    Step::Published | Step::Filtered => break,
                    _ => {}
                }
            }
        })
    });
    group.finish();
}

fn dedup_unique(c: &mut Criterion) {
    bench_stream(c, "unique", fingerprint);
}

fn dedup_half_duplicates(c: &mut Criterion) {
    bench_stream(c, "half_duplicates", |k| fingerprint(k / 2));
}

criterion_group!(benches, dedup_unique, dedup_half_duplicates);
criterion_main!(benches);
