//! pageindex - B+Tree stress driver over a file-backed page memory

use anyhow::{Context, Result};
use clap::Parser as ClapParser;
use log::info;
use rand::seq::SliceRandom;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use pageindex::access::btree::{BPlusTree, BPlusTreeConfig, TreeContext, U64Codec};
use pageindex::access::freelist::{ReuseList, ReuseListImpl};
use pageindex::access::structure::DataStructure;
use pageindex::storage::wal::{WalConfig, WalManager, WalSink};
use pageindex::storage::{PageMemory, PageMemoryConfig, PAGE_SIZE};

/// Inserts keys into a tree from several threads, removes half of them and
/// destroys the tree, validating along the way.
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory for the page file and WAL
    #[arg(short = 'D', long, default_value = "./pageindex_data")]
    dir: PathBuf,

    /// Number of keys to insert
    #[arg(short, long, default_value = "100000")]
    keys: u64,

    /// Number of inserting threads
    #[arg(short, long, default_value = "4")]
    threads: u64,

    /// Page size in bytes
    #[arg(long, default_value_t = PAGE_SIZE)]
    page_size: usize,

    /// Caps the number of rows per tree page
    #[arg(long)]
    max_per_page: Option<usize>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    std::fs::create_dir_all(&args.dir).context("Failed to create data directory")?;
    let mem = PageMemory::create(
        &args.dir.join("pages.db"),
        PageMemoryConfig {
            page_size: args.page_size,
            partition: 0,
        },
    )
    .context("Failed to create page file")?;
    let wal = Arc::new(
        WalManager::new(WalConfig {
            wal_dir: args.dir.join("wal"),
            ..WalConfig::default()
        })
        .context("Failed to create WAL")?,
    );
    let wal_sink: Arc<dyn WalSink> = wal.clone();

    let reuse = Arc::new(ReuseListImpl::create("reuse", mem.clone(), Some(wal_sink.clone()))?);
    let reuse_list: Arc<dyn ReuseList> = reuse.clone();
    let tree = BPlusTree::create(
        BPlusTreeConfig {
            name: "stress".to_string(),
            max_items_per_page: args.max_per_page,
        },
        DataStructure::new(mem.clone(), Some(wal_sink), Some(reuse_list)),
        TreeContext::global(),
        U64Codec,
    )?;
    info!("Data directory: {}", args.dir.display());

    let threads = args.threads.max(1);
    let start = Instant::now();
    insert_parallel(&tree, args.keys, threads)?;
    tree.validate_tree()?;
    info!(
        "Inserted {} keys from {} threads in {:?}, root level {}",
        args.keys,
        threads,
        start.elapsed(),
        tree.root_level()?
    );

    let start = Instant::now();
    let mut keys: Vec<u64> = (0..args.keys).filter(|k| k % 2 == 1).collect();
    keys.shuffle(&mut rand::thread_rng());
    let mut removed = 0;
    for k in &keys {
        if tree.remove(k)?.is_some() {
            removed += 1;
        }
    }
    tree.validate_tree()?;
    info!(
        "Removed {} keys in {:?}, {} left, root level {}",
        removed,
        start.elapsed(),
        tree.size()?,
        tree.root_level()?
    );

    let pages = tree.destroy(None)?;
    mem.flush()?;
    wal.flush()?;

    println!("keys inserted:   {}", args.keys);
    println!("keys removed:    {}", removed);
    println!("pages allocated: {}", mem.allocated_pages());
    println!("pages recycled:  {}", pages);
    println!("reuse list size: {}", reuse.recycled_pages_count()?);
    println!("last lsn:        {}", wal.current_lsn());
    Ok(())
}

/// Each thread inserts its own interleaved share of `0..keys`.
fn insert_parallel(tree: &BPlusTree<U64Codec>, keys: u64, threads: u64) -> Result<()> {
    thread::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|t| {
                s.spawn(move || -> Result<()> {
                    let mut k = t;
                    while k < keys {
                        tree.put(k)?;
                        k += threads;
                    }
                    Ok(())
                })
            })
            .collect();
        for handle in handles {
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("Insert thread panicked"))??;
        }
        Ok(())
    })
}
