//! Producer / Consumer Example
//!
//! Uploads chunks on transfer streams, processes each chunk on a compute
//! stream that depends on its upload, then gathers everything behind a
//! barrier.
//!
//! Run with: RUST_LOG=ringstream_core=debug cargo run --example producer_consumer

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use ringstream::prelude::*;
use tracing_subscriber::EnvFilter;

const CHUNKS: usize = 32;
const CHUNK_LEN: usize = 4096;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("RingStream Producer / Consumer Example\n");

    let config = QueueConfigBuilder::new()
        .with_compute_streams(8)
        .with_transfer_streams(4)
        .with_profiling(true)
        .build();
    let queue = queue_on_host(config)?;
    println!("Queue {} on backend '{}'", queue.id(), queue.context().backend().name());

    let staging: Arc<Vec<Mutex<Vec<u32>>>> =
        Arc::new((0..CHUNKS).map(|_| Mutex::new(Vec::new())).collect());
    let sums = Arc::new(Mutex::new(vec![0u64; CHUNKS]));

    let started = Instant::now();
    let mut kernels = Vec::with_capacity(CHUNKS);
    for chunk in 0..CHUNKS {
        let upload = {
            let staging = Arc::clone(&staging);
            queue.enqueue_with(CommandKind::BufferWrite, &[], move |stream| {
                stream.backend().launch(stream.raw(), move || {
                    let base = (chunk * CHUNK_LEN) as u32;
                    *staging[chunk].lock() = (base..base + CHUNK_LEN as u32).collect();
                    std::thread::sleep(Duration::from_micros(300));
                })?;
                Ok(())
            })?
        };

        let kernel = {
            let staging = Arc::clone(&staging);
            let sums = Arc::clone(&sums);
            queue.enqueue_with(CommandKind::KernelLaunch, &[&upload], move |stream| {
                stream.backend().launch(stream.raw(), move || {
                    let sum = staging[chunk].lock().iter().map(|&v| u64::from(v)).sum();
                    sums.lock()[chunk] = sum;
                })?;
                Ok(())
            })?
        };
        kernels.push(kernel);
    }

    let gather = queue.enqueue_barrier(&[])?;
    let total = Arc::new(Mutex::new(0u64));
    let reduce = {
        let sums = Arc::clone(&sums);
        let total = Arc::clone(&total);
        queue.enqueue_with(CommandKind::KernelLaunch, &[], move |stream| {
            stream.backend().launch(stream.raw(), move || {
                *total.lock() = sums.lock().iter().sum();
            })?;
            Ok(())
        })?
    };
    reduce.wait()?;

    let n = (CHUNKS * CHUNK_LEN) as u64;
    println!("Total: {} (expected {})", *total.lock(), n * (n - 1) / 2);
    println!("Wall time: {:?}", started.elapsed());

    let busiest = kernels
        .iter()
        .filter_map(|k| Some(k.end_time().ok()? - k.start_time().ok()?))
        .max()
        .unwrap_or(0);
    println!("Longest kernel: {busiest} ns");
    println!(
        "Barrier completed at +{} ns",
        gather.end_time()? - gather.queued_time()?
    );

    queue.finish()?;
    let stats = queue.stats();
    println!("\n{}\n{}", stats.compute, stats.transfer);
    Ok(())
}
