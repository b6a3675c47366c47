//! # CLI Argument Definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Top-level arguments of the `lumen` binary.
#[derive(Debug, Parser)]
#[command(name = "lumen")]
#[command(author = env!("CARGO_PKG_AUTHORS"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(arg_required_else_help = true)]
#[command(about = "Store, inspect and resolve media in Lumen storage")]
pub struct Cli {
    /// Configuration file (TOML). Defaults to `lumen.toml` in the working directory, if present.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level, including the selected backend.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Store a local file
    Put {
        path: PathBuf,
        /// Storage id (defaults to the file name)
        #[arg(long)]
        id: Option<String>,
        /// Display name recorded in metadata
        #[arg(long)]
        name: Option<String>,
        /// Content type (guessed from the extension when omitted)
        #[arg(long)]
        mime: Option<String>,
        /// Also derive and store a thumbnail
        #[arg(long)]
        thumbnail: bool,
    },
    /// Copy a stored file to disk
    Get { id: String, out: PathBuf },
    /// Print an object URL for a stored file
    Url { id: String },
    /// List stored files
    Ls {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Delete a stored file and its thumbnail
    Rm { id: String },
    /// Show used and available bytes
    Usage,
    /// Delete every stored file and thumbnail
    Clear,
    /// Download a remote file into storage
    Fetch {
        url: String,
        #[arg(long)]
        id: String,
    },
    /// Resolve a storage URI (`opfs://`, `idb://`, `memory://`) to an object URL
    Resolve { url: String },
}
