use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
pub struct Cli {
    /// Directory copied into the root of the image
    #[arg(long, short)]
    pub source: PathBuf,

    /// Output image file
    #[arg(long, short)]
    pub out: PathBuf,

    /// Image size in MiB
    #[arg(long, default_value_t = 32)]
    pub size: u64,

    /// Filesystem block size in bytes
    #[arg(long, short, default_value_t = 1024)]
    pub block_size: usize,

    /// Inodes per block group
    #[arg(long, default_value_t = 512)]
    pub inodes_per_group: u32,
}
