//! 驱动需要实现的特质

use alloc::{string::String, sync::Arc};
use core::{
    any::Any,
    sync::atomic::{AtomicU64, Ordering},
};

use block_dev::BlockDevice;

use crate::{DirEntry, Error, FsStat, InodeKind, Result, Stat};

/// 文件系统中的一个节点，文件或目录。
///
/// 目录操作作用在目录节点上，`name` 为单个路径分量。
/// 不支持的操作默认返回 [`Error::Unsupported`]。
#[allow(unused_variables)]
pub trait Inode: Send + Sync + Any {
    fn kind(&self) -> InodeKind;

    fn stat(&self) -> Result<Stat>;

    /// 从 `offset` 处读取，越过文件末尾的部分不读，返回读取的字节数
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// 在 `offset` 处写入，必要时扩展文件，返回写入的字节数
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize>;

    fn truncate(&self, size: u64) -> Result<()> {
        Err(Error::Unsupported)
    }

    fn lookup(&self, name: &str) -> Result<Arc<dyn Inode>>;

    fn create(&self, name: &str, mode: u16) -> Result<Arc<dyn Inode>>;

    fn mkdir(&self, name: &str, mode: u16) -> Result<Arc<dyn Inode>>;

    fn unlink(&self, name: &str) -> Result<()>;

    fn rmdir(&self, name: &str) -> Result<()>;

    /// 为 `target` 建立硬链接，`target` 须属于同一文件系统
    fn link(&self, name: &str, target: &Arc<dyn Inode>) -> Result<()> {
        Err(Error::Unsupported)
    }

    /// 把本目录中的 `name` 移到 `new_dir` 下，改名为 `new_name`。
    /// 两个目录须属于同一文件系统，目标名已存在时返回 [`Error::Exists`]。
    fn rename(&self, name: &str, new_dir: &Arc<dyn Inode>, new_name: &str) -> Result<()> {
        Err(Error::Unsupported)
    }

    /// 建立指向 `target` 的符号链接，`target` 原样保存
    fn symlink(&self, name: &str, target: &str) -> Result<Arc<dyn Inode>> {
        Err(Error::Unsupported)
    }

    /// 符号链接的目标；不是符号链接时返回 [`Error::InvalidArgument`]
    fn read_link(&self) -> Result<String> {
        Err(Error::Unsupported)
    }

    /// 读取游标 `cursor` 处的下一个目录项，连同下一次的游标。
    /// 游标0表示从头读起，`.` 与 `..` 不出现在结果中。
    fn read_dir_at(&self, cursor: usize) -> Result<Option<(DirEntry, usize)>>;

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any;
}

/// 一个文件系统实例，由注册表中的工厂创建
pub trait FileSystem: Send + Sync {
    fn name(&self) -> &'static str;

    /// 在 `source` 上挂载；不需要块设备的文件系统忽略它
    fn mount(&self, source: Option<Arc<dyn BlockDevice>>) -> Result<()>;

    fn unmount(&self) -> Result<()>;

    fn root(&self) -> Result<Arc<dyn Inode>>;

    fn stat_fs(&self) -> Result<FsStat>;

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// 时间戳来源，单位为秒
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

/// 每次询问递增的单调计数器，没有实时时钟时使用
#[derive(Debug, Default)]
pub struct TickClock(AtomicU64);

impl TickClock {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }
}

impl Clock for TickClock {
    fn now(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// 校验单个路径分量
pub fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0')
    {
        return Err(Error::InvalidArgument);
    }
    if name.len() > crate::NAME_MAX {
        return Err(Error::NameTooLong);
    }

    Ok(())
}
