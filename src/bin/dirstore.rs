//! Diagnostic CLI for the directory backend core.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use dirstore::{
    logging::init_logging,
    primitives::concurrency::LockManager,
    storage::{index::vlv::key::encode_vlv_key_value, index::EntryIdSet, BackendConfig, BackendOptions},
    types::Dn,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "dirstore",
    version,
    about = "Diagnostics for the directory backend core",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(long, global = true, value_name = "FILTER", help = "Tracing filter, e.g. dirstore=debug")]
    log: Option<String>,

    #[arg(
        long,
        global = true,
        value_name = "PATH",
        env = "DIRSTORE_CONFIG",
        help = "Backend configuration file (TOML)"
    )]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Run a random write-lock workload and fail if it does not finish in time")]
    LockStress(LockStressArgs),

    #[command(about = "Print the VLV key encoding of a hex value")]
    VlvKey {
        #[arg(value_name = "HEX", help = "Attribute value as hex; omit with --null")]
        value: Option<String>,

        #[arg(long, help = "Encode for a descending sort key")]
        descending: bool,

        #[arg(long, conflicts_with = "value", help = "Encode a missing value")]
        null: bool,
    },

    #[command(about = "Decode a hex entry ID set value")]
    Idset {
        #[arg(value_name = "HEX")]
        value: String,

        #[arg(long, default_value = "", help = "Index key the value was stored under")]
        key: String,
    },
}

#[derive(Args, Debug)]
struct LockStressArgs {
    #[arg(long, default_value_t = 8)]
    threads: usize,

    #[arg(long, default_value_t = 10_000, help = "Lock acquisitions per thread")]
    ops: u64,

    #[arg(long, default_value_t = 64, help = "Distinct leaf RDN values")]
    fanout: u32,

    #[arg(long, default_value_t = 3, help = "Maximum DN depth below the suffix")]
    depth: u32,

    #[arg(long, default_value_t = 0x5eed)]
    seed: u64,

    #[arg(long, default_value_t = 60, help = "Seconds before the run counts as hung")]
    budget_secs: u64,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logging(cli.log.as_deref())?;
    let options = match &cli.config {
        Some(path) => BackendConfig::load(path)?.into_options()?,
        None => BackendOptions::default(),
    };

    match cli.command {
        Command::LockStress(args) => lock_stress(&args, &options)?,
        Command::VlvKey {
            value,
            descending,
            null,
        } => {
            let raw = if null {
                None
            } else {
                let hex_value = value.ok_or("a HEX value or --null is required")?;
                Some(hex::decode(hex_value.trim())?)
            };
            let mut out = Vec::new();
            encode_vlv_key_value(raw.as_deref(), &mut out, !descending);
            println!("{}", hex::encode(out));
        }
        Command::Idset { value, key } => {
            let bytes = hex::decode(value.trim())?;
            let set = EntryIdSet::new_set_from_bytes(key.as_bytes(), &bytes)?;
            println!("defined: {}", set.is_defined());
            println!("size: {}", set.size());
            println!("ids: {set}");
        }
    }
    Ok(())
}

fn lock_stress(args: &LockStressArgs, options: &BackendOptions) -> Result<(), Box<dyn Error>> {
    let manager = LockManager::new(options);
    let acquired = Arc::new(AtomicU64::new(0));
    let timeouts = Arc::new(AtomicU64::new(0));
    let started = Instant::now();

    let handles: Vec<_> = (0..args.threads)
        .map(|worker| {
            let manager = manager.clone();
            let acquired = Arc::clone(&acquired);
            let timeouts = Arc::clone(&timeouts);
            let (ops, fanout, depth) = (args.ops, args.fanout.max(1), args.depth.max(1));
            let mut rng = StdRng::seed_from_u64(args.seed ^ worker as u64);
            thread::spawn(move || -> dirstore::types::Result<()> {
                let mut ctx = manager.context();
                for _ in 0..ops {
                    let dn = random_dn(&mut rng, fanout, depth)?;
                    match manager.try_write_lock_entry(&mut ctx, &dn) {
                        Some(lock) => {
                            acquired.fetch_add(1, Ordering::Relaxed);
                            drop(lock);
                        }
                        None => {
                            timeouts.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                Ok(())
            })
        })
        .collect();

    let budget = Duration::from_secs(args.budget_secs);
    while !handles.iter().all(|h| h.is_finished()) {
        if started.elapsed() > budget {
            return Err(format!("lock workload did not finish within {budget:?}").into());
        }
        thread::sleep(Duration::from_millis(10));
    }
    for handle in handles {
        handle.join().map_err(|_| "lock stress worker panicked")??;
    }

    let elapsed = started.elapsed();
    info!(?elapsed, "lock stress finished");
    println!(
        "threads={} acquired={} timeouts={} residual={} elapsed_ms={}",
        args.threads,
        acquired.load(Ordering::Relaxed),
        timeouts.load(Ordering::Relaxed),
        manager.table_len(),
        elapsed.as_millis()
    );
    Ok(())
}

fn random_dn(rng: &mut StdRng, fanout: u32, depth: u32) -> dirstore::types::Result<Dn> {
    let mut dn = String::new();
    let levels = rng.gen_range(1..=depth);
    for level in (0..levels).rev() {
        let value = rng.gen_range(0..fanout);
        dn.push_str(&format!("ou=l{level}v{value},"));
    }
    dn.push_str("dc=example,dc=com");
    Dn::parse(&dn)
}
