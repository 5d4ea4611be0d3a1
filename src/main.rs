use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use filesage::{
    cli::{Cli, Command, FolderAction},
    error::{Error, Result},
    search::{self, SearchRequest},
    CachedSearch, DataDir, Embedder, IndexManager, MetadataStore, QueryCache,
    SearchPipeline, VectorStore,
};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("FILESAGE_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let metadata = Arc::new(MetadataStore::open(&data_dir.metadata_db()));
    let vectors = Arc::new(VectorStore::open(&data_dir.vectors_db()));
    let embedder = Arc::new(Embedder::new());
    let cache = Arc::new(QueryCache::new());

    let manager = Arc::new(IndexManager::new(
        Arc::clone(&metadata),
        Arc::clone(&vectors),
        Arc::clone(&embedder),
        Arc::clone(&cache),
    ));

    match cli.command {
        Command::Folder { action } => match action {
            FolderAction::Add { path } => {
                manager.add_root(&path)?;
                let report = join(manager.update_incremental()).await?;
                println!(
                    "Watching {} ({} files indexed)",
                    path.display(),
                    report.updated
                );
            }
            FolderAction::Remove { path } => {
                if manager.remove_root(&path) {
                    println!("Stopped watching {}", path.display());
                } else {
                    return Err(Error::NotFound {
                        kind: "folder",
                        name: path.display().to_string(),
                    });
                }
            }
            FolderAction::List { json } => {
                let roots = manager.roots();
                if json {
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&roots)
                            .unwrap_or_default()
                    );
                } else if roots.is_empty() {
                    println!("No folders are being watched.");
                } else {
                    for root in roots {
                        println!("{root}");
                    }
                }
            }
        },
        Command::Index(args) => {
            if manager.index_file(&args.path).await? {
                println!("Indexed {}", args.path.display());
            } else {
                println!("Unchanged, skipped {}", args.path.display());
            }
        }
        Command::Search(args) => {
            let pipeline = Arc::new(SearchPipeline::new(
                Arc::clone(&metadata),
                Arc::clone(&vectors),
                Arc::clone(&embedder),
            ));
            let searcher =
                CachedSearch::new(pipeline, Arc::clone(&cache));

            let mut request = SearchRequest::new(&args.query, args.count);
            request.filters.file_type = args.file_type;
            request.filters.path_prefix = args.folder;

            let response = searcher.search(&request).await;
            if args.json {
                search::format_json(&response);
            } else {
                search::format_human(&response);
            }
        }
        Command::Rebuild => {
            let report = join(manager.rebuild_all()).await?;
            println!(
                "Rebuilt index: {} files indexed, {} failed ({}ms)",
                report.indexed, report.failed, report.elapsed_ms
            );
        }
        Command::Sync => {
            let report = join(manager.update_incremental()).await?;
            println!(
                "Synced: {} checked, {} updated, {} removed ({}ms)",
                report.checked, report.updated, report.removed,
                report.elapsed_ms
            );
        }
        Command::Compact => {
            if vectors.compact() {
                println!("Vector store compacted.");
            } else {
                println!("Nothing to compact (memory-only backend).");
            }
        }
        Command::Status(args) => {
            let stats = manager.stats();
            if args.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&stats).unwrap_or_default()
                );
            } else {
                println!("Indexed files:      {}", stats.record_count);
                println!("Stored vectors:     {}", stats.vector_count);
                println!("Storage backend:    {}", stats.storage_backend);
                println!(
                    "Embedding model:    {}",
                    if stats.model_available {
                        "available"
                    } else {
                        "fallback"
                    }
                );
                println!("Watched folders:    {}", stats.watch_roots.len());
                for root in &stats.watch_roots {
                    println!("  {root}");
                }
                if let Some(ref ts) = stats.last_rebuild {
                    println!("Last rebuild:       {ts}");
                }
                if let Some(ref ts) = stats.last_incremental {
                    println!("Last sync:          {ts}");
                }
            }
        }
        Command::History(args) => {
            if args.clear {
                metadata.clear_history();
                println!("Search history cleared.");
            } else {
                let entries = metadata.recent_searches(args.count);
                if entries.is_empty() {
                    println!("No searches recorded.");
                }
                for entry in entries {
                    println!(
                        "{}  {:>3} hit(s)  [{}]  {}",
                        entry.searched_at,
                        entry.result_count,
                        entry.search_type,
                        entry.query
                    );
                }
            }
        }
    }

    Ok(())
}

async fn join<T>(handle: tokio::task::JoinHandle<T>) -> Result<T> {
    handle
        .await
        .map_err(|e| Error::Config(format!("background task failed: {e}")))
}
