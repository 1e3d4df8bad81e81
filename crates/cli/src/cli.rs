use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "artcache")]
#[command(about = "Operator CLI for the content-addressed cover art cache")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, help = "Cache root directory (default: $ARTCACHE_ROOT or the platform cache dir)")]
    pub root: Option<PathBuf>,

    #[arg(
        short = 'l',
        long,
        global = true,
        help = "Log level filter",
        default_value = "warn"
    )]
    pub level: String,

    #[arg(long, global = true, help = "Output results as JSON")]
    pub json: bool,

    #[arg(long, global = true, help = "Stream key limit", default_value_t = 500)]
    pub max_keys: usize,

    #[arg(long, global = true, help = "Source limit", default_value_t = 500)]
    pub max_sources: usize,

    #[arg(long, global = true, help = "Object limit", default_value_t = 1500)]
    pub max_objects: usize,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "Show cache entry counters")]
    Stats,

    #[command(about = "Run garbage collection and report the outcome")]
    Gc,

    #[command(about = "Cache the image behind a URI for a stream key")]
    AddUri {
        #[arg(help = "Stream key as hex (at least two bytes)")]
        key: String,
        #[arg(help = "Priority in [1, 255]")]
        priority: u8,
        #[arg(help = "Image URI to download")]
        uri: String,
    },

    #[command(about = "Cache a local image file for a stream key")]
    AddData {
        #[arg(help = "Stream key as hex (at least two bytes)")]
        key: String,
        #[arg(help = "Priority in [1, 255]")]
        priority: u8,
        #[arg(help = "Image file to read")]
        file: PathBuf,
    },

    #[command(about = "Fetch a cached image")]
    Get {
        #[arg(help = "Stream key as hex")]
        key: String,
        #[arg(help = "Requested format, e.g. png")]
        format: String,
        #[arg(long, help = "Exact priority; highest available when omitted")]
        priority: Option<u8>,
        #[arg(long, default_value = "", help = "Hash of the copy the client already holds")]
        known_hash: String,
        #[arg(short = 'o', long, help = "Write the image bytes to this file")]
        output: Option<PathBuf>,
    },

    #[command(about = "Remove a stream key entry")]
    Delete {
        #[arg(help = "Stream key as hex")]
        key: String,
        #[arg(help = "Priority in [1, 255]")]
        priority: u8,
    },
}
