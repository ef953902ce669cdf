//! 在宿主机上制作 ext2 镜像

mod block_file;

use std::fmt::Display;
use std::fs;
use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use vfs::{Clock, OpenFlag, Vfs};

pub use self::block_file::{BlockFile, SECTOR_SIZE};

/// 宿主机的实时时钟
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs())
    }
}

pub fn io_error(err: impl Display) -> io::Error {
    io::Error::other(err.to_string())
}

/// 把宿主目录 `source` 的内容递归复制到 `vfs` 中已存在的目录 `dest`，
/// 返回复制的文件数。名字不是 UTF-8 的项与非普通文件被跳过。
pub fn copy_tree(vfs: &Vfs, source: &Path, dest: &str) -> io::Result<usize> {
    let mut entries = fs::read_dir(source)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    let mut copied = 0;
    for entry in entries {
        let host_path = entry.path();
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            warn!("skipping {host_path:?}: name is not UTF-8");
            continue;
        };
        let path = format!("{}/{name}", dest.trim_end_matches('/'));

        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            vfs.mkdir(&path).map_err(io_error)?;
            copied += copy_tree(vfs, &host_path, &path)?;
        } else if file_type.is_file() {
            let data = fs::read(&host_path)?;
            let mut file = vfs
                .open(&path, OpenFlag::Write | OpenFlag::Create | OpenFlag::Truncate)
                .map_err(io_error)?;
            file.write_all(&data).map_err(io_error)?;
            file.close().map_err(io_error)?;
            debug!("{host_path:?} -> {path} ({} bytes)", data.len());
            copied += 1;
        } else {
            warn!("skipping {host_path:?}: not a regular file or directory");
        }
    }

    Ok(copied)
}
