use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "filesage",
    about = "Hybrid keyword + semantic search over your local files"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage watched folders
    Folder {
        #[command(subcommand)]
        action: FolderAction,
    },
    /// Index a single file
    Index(IndexArgs),
    /// Search indexed files
    Search(SearchArgs),
    /// Drop the index and re-index every watched folder
    Rebuild,
    /// Reconcile the index with the filesystem (incremental)
    Sync,
    /// Compact the on-disk vector store
    Compact,
    /// Show index status and statistics
    Status(StatusArgs),
    /// Show or clear recent searches
    History(HistoryArgs),
}

// -- Folder subcommands --

#[derive(Debug, Subcommand)]
pub enum FolderAction {
    /// Start watching a directory
    Add {
        /// Path to the directory
        path: PathBuf,
    },
    /// Stop watching a directory and drop its indexed data
    Remove {
        /// Path to the directory
        path: PathBuf,
    },
    /// List watched directories
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

// -- Index --

#[derive(Debug, Parser)]
pub struct IndexArgs {
    /// File to index
    pub path: PathBuf,
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The search query
    pub query: String,

    /// Number of results to return
    #[arg(short = 'n', long, default_value = "10")]
    pub count: usize,

    /// Only return files of this type (extension)
    #[arg(short = 't', long)]
    pub file_type: Option<String>,

    /// Only return files under this path prefix
    #[arg(short = 'f', long)]
    pub folder: Option<String>,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- History --

#[derive(Debug, Parser)]
pub struct HistoryArgs {
    /// Number of entries to show
    #[arg(short = 'n', long, default_value = "20")]
    pub count: usize,

    /// Clear the search history
    #[arg(long)]
    pub clear: bool,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn parse_search_defaults() {
        let cli = Cli::parse_from(["filesage", "search", "hello"]);
        match cli.command {
            Command::Search(args) => {
                assert_eq!(args.query, "hello");
                assert_eq!(args.count, 10);
                assert!(args.file_type.is_none());
                assert!(args.folder.is_none());
                assert!(!args.json);
            }
            _ => panic!("expected search command"),
        }
    }

    #[test]
    fn parse_search_with_filters() {
        let cli = Cli::parse_from([
            "filesage", "search", "budget", "-n", "5", "-t", "txt", "-f",
            "/docs", "--json",
        ]);
        match cli.command {
            Command::Search(args) => {
                assert_eq!(args.count, 5);
                assert_eq!(args.file_type.as_deref(), Some("txt"));
                assert_eq!(args.folder.as_deref(), Some("/docs"));
                assert!(args.json);
            }
            _ => panic!("expected search command"),
        }
    }

    #[test]
    fn parse_folder_add() {
        let cli = Cli::parse_from(["filesage", "folder", "add", "/tmp/docs"]);
        match cli.command {
            Command::Folder {
                action: FolderAction::Add { path },
            } => assert_eq!(path, PathBuf::from("/tmp/docs")),
            _ => panic!("expected folder add"),
        }
    }

    #[test]
    fn global_flags_apply_after_subcommand() {
        let cli = Cli::parse_from(["filesage", "status", "-vv"]);
        assert_eq!(cli.verbose, 2);
    }
}
