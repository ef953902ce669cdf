//! # 内存文件系统
//!
//! 目录拥有其子节点，文件拥有一段字节向量，符号链接保存目标路径，
//! 不经过块设备与缓存。
//! 卸载即丢弃整棵树，再次挂载得到空的根目录。

#![no_std]

extern crate alloc;

mod node;

use alloc::{
    boxed::Box,
    sync::{Arc, Weak},
};
use core::sync::atomic::{AtomicU64, Ordering};

use block_dev::BlockDevice;
use log::info;
use spin::{Mutex, RwLock};
use vfs::{Clock, Error, FileSystem, FsStat, Inode, NAME_MAX, Registry, Result, TickClock};

pub use self::node::TmpNode;

pub const FS_NAME: &str = "tmpfs";

/// 统计信息里使用的块大小
const BLOCK_SIZE: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TmpfsConfig {
    /// 文件内容的总字节数上限
    pub max_bytes: u64,
    /// 节点总数上限，包括根目录
    pub max_inodes: u64,
}

impl TmpfsConfig {
    pub const DEFAULT_MAX_BYTES: u64 = 64 << 20;
    pub const DEFAULT_MAX_INODES: u64 = 4096;
}

impl Default for TmpfsConfig {
    fn default() -> Self {
        Self {
            max_bytes: Self::DEFAULT_MAX_BYTES,
            max_inodes: Self::DEFAULT_MAX_INODES,
        }
    }
}

/// 一次挂载内所有节点共享的预算与时钟
pub(crate) struct Shared {
    config: TmpfsConfig,
    clock: Arc<dyn Clock>,
    next_ino: AtomicU64,
    used_bytes: AtomicU64,
    used_inodes: AtomicU64,
    rename_lock: Mutex<()>,
}

impl Shared {
    fn new(config: TmpfsConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            next_ino: AtomicU64::new(1),
            used_bytes: AtomicU64::new(0),
            used_inodes: AtomicU64::new(0),
            rename_lock: Mutex::new(()),
        }
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// 占用一个节点，返回其编号
    pub fn reserve_inode(&self) -> Result<u64> {
        reserve(&self.used_inodes, 1, self.config.max_inodes)?;
        Ok(self.next_ino.fetch_add(1, Ordering::Relaxed))
    }

    pub fn release_inode(&self) {
        self.used_inodes.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn reserve_bytes(&self, bytes: u64) -> Result<()> {
        reserve(&self.used_bytes, bytes, self.config.max_bytes)
    }

    pub fn release_bytes(&self, bytes: u64) {
        self.used_bytes.fetch_sub(bytes, Ordering::AcqRel);
    }
}

fn reserve(counter: &AtomicU64, amount: u64, limit: u64) -> Result<()> {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
            used.checked_add(amount).filter(|&total| total <= limit)
        })
        .map(drop)
        .map_err(|_| Error::NoSpace)
}

struct Mounted {
    shared: Arc<Shared>,
    root: Arc<TmpNode>,
}

pub struct TmpFileSystem {
    config: TmpfsConfig,
    clock: Arc<dyn Clock>,
    mounted: RwLock<Option<Mounted>>,
}

impl TmpFileSystem {
    pub fn new(config: TmpfsConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            mounted: RwLock::new(None),
        }
    }
}

impl Default for TmpFileSystem {
    fn default() -> Self {
        Self::new(TmpfsConfig::default(), Arc::new(TickClock::new()))
    }
}

impl FileSystem for TmpFileSystem {
    fn name(&self) -> &'static str {
        FS_NAME
    }

    fn mount(&self, _source: Option<Arc<dyn BlockDevice>>) -> Result<()> {
        let mut mounted = self.mounted.write();
        if mounted.is_some() {
            return Err(Error::Busy);
        }

        let shared = Arc::new(Shared::new(self.config, Arc::clone(&self.clock)));
        let root = TmpNode::new_dir(&shared, vfs::DEFAULT_DIR_MODE, Weak::new())?;
        *mounted = Some(Mounted { shared, root });
        info!("tmpfs mounted, {:?}", self.config);

        Ok(())
    }

    fn unmount(&self) -> Result<()> {
        self.mounted.write().take().ok_or(Error::NotFound)?;
        Ok(())
    }

    fn root(&self) -> Result<Arc<dyn Inode>> {
        self.mounted
            .read()
            .as_ref()
            .map(|mounted| Arc::clone(&mounted.root) as Arc<dyn Inode>)
            .ok_or(Error::NotFound)
    }

    fn stat_fs(&self) -> Result<FsStat> {
        let mounted = self.mounted.read();
        let shared = &mounted.as_ref().ok_or(Error::NotFound)?.shared;
        let used_bytes = shared.used_bytes.load(Ordering::Acquire);
        let used_inodes = shared.used_inodes.load(Ordering::Acquire);

        Ok(FsStat {
            block_size: BLOCK_SIZE,
            total_blocks: self.config.max_bytes / BLOCK_SIZE,
            free_blocks: (self.config.max_bytes - used_bytes) / BLOCK_SIZE,
            total_inodes: self.config.max_inodes,
            free_inodes: self.config.max_inodes - used_inodes,
            max_name_len: NAME_MAX,
        })
    }
}

/// 以 [`FS_NAME`] 注册，每个挂载得到独立的树与预算
pub fn register(
    registry: &mut Registry,
    config: TmpfsConfig,
    clock: Arc<dyn Clock>,
) -> Result<()> {
    registry.register_filesystem(FS_NAME, move || {
        Box::new(TmpFileSystem::new(config, Arc::clone(&clock))) as Box<dyn FileSystem>
    })
}
