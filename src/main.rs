/*!
 * Ash Stress Driver
 *
 * Hammers every primitive from real threads and checks the properties the
 * library promises:
 * - Double buffer: a reader sees strictly increasing values, ending on the last write
 * - Optimistic buffer: no torn reads, never goes backwards
 * - Chunk pool: no slot handed to two owners at once
 *
 * Environment variables:
 * - ASH_STRESS_ITERS: writes per check (default: 200000)
 * - ASH_STRESS_READERS: reader / pool threads (default: 4)
 */

use anyhow::{bail, ensure, Context, Result};
use ash_sync::monitoring::span_operation;
use ash_sync::{init_tracing, ChunkPool, DoubleBuffer, OptimisticBuffer, SpinConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{info, warn};

const DEFAULT_ITERS: u64 = 200_000;
const DEFAULT_READERS: usize = 4;
const PAGE_WIDTH: usize = 4;
const HELD_PER_THREAD: usize = 16;

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .ok()
            .with_context(|| format!("{} must be a positive integer, got {:?}", name, raw)),
        Err(_) => Ok(default),
    }
}

fn main() -> Result<()> {
    init_tracing();

    let iters: u64 = env_or("ASH_STRESS_ITERS", DEFAULT_ITERS)?;
    let readers: usize = env_or("ASH_STRESS_READERS", DEFAULT_READERS)?;
    ensure!(iters > 0 && readers > 0, "iterations and readers must be non-zero");

    info!(iters, readers, "Ash stress run starting");
    info!("================================================");

    double_buffer_check(iters)?;
    optimistic_check(iters, readers)?;
    pool_check(iters, readers)?;

    info!("================================================");
    info!("All checks passed");
    Ok(())
}

/// One writer counts up; the reader must see a strictly increasing sequence
/// that ends on the final value
fn double_buffer_check(iters: u64) -> Result<()> {
    let mut span = span_operation("double_buffer");
    let (mut writer, mut reader) = DoubleBuffer::<u64>::new().split();

    let producer = thread::Builder::new()
        .name("db-writer".into())
        .spawn(move || {
            for value in 1..=iters {
                writer.write(value);
            }
        })?;

    let mut last = 0u64;
    let mut reads = 0u64;
    let mut value = 0u64;
    while last < iters {
        if reader.try_read(&mut value) {
            if value <= last {
                span.record_result(false);
                bail!("double buffer went backwards: read {} after {}", value, last);
            }
            last = value;
            reads += 1;
        } else {
            std::hint::spin_loop();
        }
    }

    producer
        .join()
        .map_err(|_| anyhow::anyhow!("double buffer writer panicked"))?;
    ensure!(
        !reader.try_read(&mut value),
        "double buffer produced a value after the final write was consumed"
    );

    span.record_items(reads);
    span.record_result(true);
    info!(
        writes = iters,
        reads,
        coalesced = iters - reads,
        "Double buffer check passed"
    );
    Ok(())
}

/// Every page write is `[i; PAGE_WIDTH]`, so any mixed array is a torn read
fn optimistic_check(iters: u64, readers: usize) -> Result<()> {
    let mut span = span_operation("optimistic_buffer");
    let (mut writer, reader) = OptimisticBuffer::<[u64; PAGE_WIDTH], 3>::new().split();
    let done = Arc::new(AtomicBool::new(false));

    let consumers = (0..readers)
        .map(|n| {
            let reader = reader.clone().with_spin_config(SpinConfig::cooperative());
            let done = done.clone();
            thread::Builder::new()
                .name(format!("opt-reader-{}", n))
                .spawn(move || -> Result<u64> {
                    let mut last = 0u64;
                    let mut reads = 0u64;
                    let mut page = [0u64; PAGE_WIDTH];
                    while !done.load(Ordering::Acquire) {
                        reader.wait_read(&mut page);
                        ensure!(
                            page.iter().all(|&v| v == page[0]),
                            "torn read: {:?}",
                            page
                        );
                        ensure!(
                            page[0] >= last,
                            "optimistic buffer went backwards: {} after {}",
                            page[0],
                            last
                        );
                        last = page[0];
                        reads += 1;
                    }
                    Ok(reads)
                })
        })
        .collect::<std::io::Result<Vec<_>>>()?;

    for value in 1..=iters {
        writer.write([value; PAGE_WIDTH]);
    }
    done.store(true, Ordering::Release);

    let mut total_reads = 0u64;
    let mut failure = None;
    for consumer in consumers {
        match consumer.join() {
            Ok(Ok(reads)) => total_reads += reads,
            Ok(Err(err)) => failure = Some(err),
            Err(_) => failure = Some(anyhow::anyhow!("optimistic reader panicked")),
        }
    }
    if let Some(err) = failure {
        span.record_result(false);
        return Err(err);
    }

    let last = reader.load();
    ensure!(last == [iters; PAGE_WIDTH], "final page {:?} != {}", last, iters);

    span.record_items(total_reads);
    span.record_result(true);
    info!(
        writes = iters,
        reads = total_reads,
        pages = reader.page_count(),
        "Optimistic buffer check passed"
    );
    Ok(())
}

/// Threads box, verify, and drop values; a slot shared by two owners shows
/// up as a clobbered tag
fn pool_check(iters: u64, threads: usize) -> Result<()> {
    let mut span = span_operation("chunk_pool");
    let pool = Arc::new(ChunkPool::<(usize, u64)>::new());
    let per_thread = (iters / threads as u64).max(1);

    let workers = (0..threads)
        .map(|id| {
            let pool = pool.clone();
            thread::Builder::new()
                .name(format!("pool-{}", id))
                .spawn(move || -> Result<()> {
                    let mut held = Vec::with_capacity(HELD_PER_THREAD);
                    for round in 0..per_thread {
                        held.push(pool.boxed((id, round))?);
                        if held.len() == HELD_PER_THREAD {
                            for item in held.drain(..) {
                                ensure!(
                                    item.0 == id,
                                    "slot shared across threads: owner {} saw {:?}",
                                    id,
                                    *item
                                );
                                ensure!(
                                    item.1 <= round && item.1 + HELD_PER_THREAD as u64 > round,
                                    "slot reused while held: {:?} in round {}",
                                    *item,
                                    round
                                );
                            }
                        }
                    }
                    Ok(())
                })
        })
        .collect::<std::io::Result<Vec<_>>>()?;

    let mut failure = None;
    for worker in workers {
        match worker.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => failure = Some(err),
            Err(_) => failure = Some(anyhow::anyhow!("pool worker panicked")),
        }
    }
    if let Some(err) = failure {
        span.record_result(false);
        return Err(err);
    }

    let stats = pool.stats();
    if stats.capacity > threads * HELD_PER_THREAD * 4 {
        warn!(capacity = stats.capacity, "Pool grew more than expected for the held set");
    }

    let summary = serde_json::to_string(&stats)?;
    span.record_items(per_thread * threads as u64);
    span.record_result(true);
    info!(stats = %summary, "Chunk pool check passed");
    Ok(())
}
