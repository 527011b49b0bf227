use hft_dedup::cnc::CNC_APP_MIN_WORDS;
use hft_dedup::{
    Cnc, CncSignal, DedupTile, Fseq, InLink, MCache, MonoClock, Quantiles, Receiver, Sender,
    TCache, TileConfig, mono_time_ns, ts_comp, ts_decomp,
};
use std::env;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::info;

const RING_DEPTH: usize = 1024;
const TCACHE_DEPTH: usize = 1 << 16;
const ACK_EVERY: u64 = 64;
const PAYLOAD_SZ: u16 = 200;

type BoxResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Every producer publishes the same fingerprint sequence, so each fragment
/// should reach the output once. Odd multiplier: distinct and never null.
fn fingerprint(k: u64) -> u64 {
    (k + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

fn usage(prog: &str) -> ! {
    eprintln!("Usage: {} [in_cnt] [out_cnt] [frags_per_in]", prog);
    std::process::exit(1);
}

fn main() -> BoxResult<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    let arg = |i: usize, default: u64| -> u64 {
        match args.get(i) {
            None => default,
            Some(s) => s.parse().unwrap_or_else(|_| usage(&args[0])),
        }
    };
    let in_cnt = arg(1, 2) as usize;
    let out_cnt = arg(2, 2) as usize;
    let frags = arg(3, 100_000);

    let cnc = Arc::new(Cnc::new(CNC_APP_MIN_WORDS));
    let out_mcache = MCache::new(RING_DEPTH, 0);
    let out_fseqs: Vec<Arc<Fseq>> = (0..out_cnt).map(|_| Arc::new(Fseq::new(0))).collect();

    let links: Vec<InLink> = (0..in_cnt)
        .map(|_| InLink::new(MCache::new(RING_DEPTH, 0), Arc::new(Fseq::new(0))))
        .collect();

    let tile = DedupTile::boot(
        Arc::clone(&cnc),
        links.clone(),
        TCache::new(TCACHE_DEPTH, 0)?,
        Arc::clone(&out_mcache),
        out_fseqs.clone(),
        &TileConfig::default(),
        MonoClock,
    )?;
    let tile = thread::spawn(move || tile.run());

    let stop = Arc::new(AtomicBool::new(false));
    let consumers: Vec<_> = out_fseqs
        .iter()
        .map(|fseq| {
            let mut rx = Receiver::new(Arc::clone(&out_mcache), Arc::clone(fseq));
            let stop = Arc::clone(&stop);
            thread::spawn(move || consume(&mut rx, &stop))
        })
        .collect();

    let producers: Vec<_> = links
        .iter()
        .map(|link| {
            let mut tx = Sender::new(Arc::clone(&link.mcache), vec![Arc::clone(&link.fseq)]);
            thread::spawn(move || {
                for k in 0..frags {
                    tx.send(fingerprint(k), k as u32, PAYLOAD_SZ, 0, ts_comp(mono_time_ns()));
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().map_err(|_| "producer panicked")?;
    }

    // Every input fully released means every fragment was consumed
    // downstream.
    while links.iter().any(|link| link.fseq.query() < frags) {
        thread::sleep(Duration::from_millis(1));
    }

    info!("signaling halt");
    cnc.signal(CncSignal::Halt);
    tile.join().map_err(|_| "tile panicked")?;
    let signal = cnc.wait(CncSignal::Halt, Duration::from_secs(1));
    info!(%signal, "tile stopped");

    stop.store(true, Ordering::Release);
    let mut reports = Vec::with_capacity(out_cnt);
    for consumer in consumers {
        reports.push(consumer.join().map_err(|_| "consumer panicked")?);
    }

    let cnc_diag = cnc.diag_snapshot();
    println!(
        "in_cnt={} out_cnt={} frags_per_in={} backp_cnt={}",
        in_cnt, out_cnt, frags, cnc_diag.backp_cnt
    );
    for (idx, link) in links.iter().enumerate() {
        let diag = link.fseq.diag_snapshot();
        println!(
            "in[{}] pub_cnt={} filt_cnt={} ovrnp_cnt={} ovrnr_cnt={}",
            idx, diag.pub_cnt, diag.filt_cnt, diag.ovrnp_cnt, diag.ovrnr_cnt
        );
    }
    println!("{}", Quantiles::CSV_HEADER);
    for (idx, (fseq, latencies)) in out_fseqs.iter().zip(reports).enumerate() {
        let slow_cnt = fseq.diag_snapshot().slow_cnt;
        match Quantiles::from_samples(latencies) {
            Some(q) => println!("out[{}] (slow_cnt={}),{}", idx, slow_cnt, q),
            None => println!("out[{}] (slow_cnt={}),0", idx, slow_cnt),
        }
    }
    Ok(())
}

/// Drains the output until told to stop, acknowledging in batches. Returns
/// end-to-end latencies in ns.
fn consume(rx: &mut Receiver, stop: &AtomicBool) -> Vec<u64> {
    let mut latencies = Vec::new();
    let mut unacked = 0u64;
    loop {
        match rx.try_recv() {
            Some(meta) => {
                let now = mono_time_ns();
                latencies.push((now - ts_decomp(meta.tsorig, now)).max(0) as u64);
                unacked += 1;
                if unacked == ACK_EVERY {
                    rx.ack();
                    unacked = 0;
                }
            }
            None => {
                rx.ack();
                unacked = 0;
                if stop.load(Ordering::Acquire) {
                    return latencies;
                }
                core::hint::spin_loop();
            }
        }
    }
}
