//! Simulates a crowd of participants requesting stimuli from one pool at once and
//! prints how evenly the consumptions spread over the items.
//!
//! cargo run --bin pool_sim -- --items 12 --participants 100 --mode legacy

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};
use serde_json::{json, Map};

use cued_drawing_server::assign::{AssignmentService, ConsumptionRequest, Provenance};
use cued_drawing_server::config::{AssignConfig, AssignMode};
use cued_drawing_server::fallback::FallbackSampler;
use cued_drawing_server::pool::interleave::Interleaved;
use cued_drawing_server::pool::memory::MemoryStore;
use cued_drawing_server::pool::{CollectionRef, ConsumerId, StimulusItem, TiebreakKey};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Mode {
    Atomic,
    Legacy,
}

#[derive(Parser, Debug)]
#[command(name = "pool_sim", about = "Concurrent stimulus assignment simulator")]
struct Args {
    #[arg(long, default_value_t = 10)]
    items: usize,
    #[arg(long, default_value_t = 95)]
    participants: usize,
    #[arg(long, value_enum, default_value_t = Mode::Atomic)]
    mode: Mode,
    /// Scheduler yields injected around each store call.
    #[arg(long, default_value_t = 2)]
    yields: usize,
    #[arg(long, default_value_t = 64)]
    max_claim_attempts: u32,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();
    let args = Args::parse();
    if args.items == 0 {
        bail!("--items must be at least 1");
    }

    let pool = CollectionRef::new("sim", "stimuli");
    let memory = MemoryStore::new();
    memory.seed_pool(
        pool.clone(),
        (0..args.items)
            .map(|i| {
                let mut payload = Map::new();
                payload.insert("category".into(), json!(format!("cat-{i}")));
                StimulusItem::new(format!("item-{i:03}"), Some(TiebreakKey::Int(i as i64)), payload)
            })
            .collect(),
    );
    let store = Arc::new(Interleaved::new(memory, args.yields));

    let cfg = AssignConfig {
        mode: match args.mode {
            Mode::Atomic => AssignMode::Atomic,
            Mode::Legacy => AssignMode::Legacy,
        },
        max_claim_attempts: args.max_claim_attempts,
        ..AssignConfig::default()
    };
    let service = Arc::new(AssignmentService::new(store.clone(), FallbackSampler::default(), cfg));

    let mut handles = Vec::with_capacity(args.participants);
    for p in 0..args.participants {
        let service = service.clone();
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            let req = ConsumptionRequest::single(pool, ConsumerId(format!("sim-{p:04}")));
            service.get_single_stimulus(&req).await
        }));
    }

    let mut tracked = 0usize;
    let mut failed = 0usize;
    for h in handles {
        match h.await? {
            Ok(a) if a.provenance == Provenance::Tracked => tracked += 1,
            Ok(_) => {}
            Err(e) => {
                failed += 1;
                tracing::warn!(error = %e, "request failed");
            }
        }
    }

    let counts: BTreeMap<String, usize> = store
        .inner()
        .snapshot(&pool)
        .iter()
        .map(|it| (it.id.to_string(), it.num_served()))
        .collect();
    let min = counts.values().copied().min().unwrap_or(0);
    let max = counts.values().copied().max().unwrap_or(0);
    let bound = args.participants.div_ceil(args.items);

    println!("mode={:?} items={} participants={}", args.mode, args.items, args.participants);
    for (id, n) in &counts {
        println!("  {id:<10} {n:>4} {}", "#".repeat(*n));
    }
    println!("tracked={tracked} failed={failed} min={min} max={max} spread={} bound={bound}", max - min);
    if max > bound {
        println!("over-served: at least one item exceeded ceil(participants / items)");
    }
    Ok(())
}
