mod cli;

use std::fs::OpenOptions;
use std::io;
use std::sync::Arc;

use block_cache::{BufferCache, DEFAULT_CAPACITY};
use block_dev::BlockDevice;
use clap::Parser;
use cli::Cli;
use ext2::FormatOptions;
use ext2_fuse::{BlockFile, SystemClock, copy_tree, io_error};
use typed_bytesize::ByteSizeIec;
use vfs::{Registry, Vfs};

fn main() -> io::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    println!("source={:?}\nout={:?}", cli.source, cli.out);

    let disk_size = ByteSizeIec::mib(cli.size).0;
    let fd = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&cli.out)?;
    fd.set_len(disk_size)?;
    let dev: Arc<dyn BlockDevice> = Arc::new(BlockFile::new(fd)?);

    let cache = Arc::new(BufferCache::new(DEFAULT_CAPACITY));
    let opts = FormatOptions {
        block_size: cli.block_size,
        inodes_per_group: cli.inodes_per_group,
        ..Default::default()
    };
    ext2::format(&dev, &cache, &opts).map_err(io_error)?;

    let mut registry = Registry::new();
    ext2::register(&mut registry, Arc::clone(&cache), Arc::new(SystemClock)).map_err(io_error)?;
    let vfs = Vfs::new(registry, Some(cache));
    vfs.mount("/", ext2::FS_NAME, Some(dev)).map_err(io_error)?;

    let copied = copy_tree(&vfs, &cli.source, "/")?;
    let stat = vfs.stat_fs("/").map_err(io_error)?;
    log::info!(
        "packed {copied} files, {} of {} blocks free",
        stat.free_blocks,
        stat.total_blocks
    );

    vfs.unmount("/").map_err(io_error)
}
