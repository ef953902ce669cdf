//! # ext2 文件系统
//!
//! 磁盘布局自前向后为：
//!
//! - 引导块：卷的前1024字节，不使用
//! - 超级块：位于字节1024处，记录整个卷的参数
//! - 若干块组，每组依次为超级块副本、组描述符表、块位图、inode位图、inode表、数据块
//!
//! 对设备的一切访问都经过 [`BufferCache`]，驱动在任意时刻至多持有一个缓冲区。
//! 元数据的修改互斥进行，读取可以并发。

#![no_std]

extern crate alloc;

mod dir;
mod fs;
mod layout;
mod mkfs;
mod volume;

use alloc::{boxed::Box, sync::Arc};

use block_cache::BufferCache;
use vfs::{Clock, FileSystem, Registry, Result};

pub use self::{
    fs::{Ext2FileSystem, Ext2Inode},
    mkfs::{FormatOptions, format},
};

pub const FS_NAME: &str = "ext2";

/// 根目录的 inode 编号
pub const ROOT_INO: u32 = 2;

/// 以 [`FS_NAME`] 注册，所有挂载共用同一块缓存
pub fn register(
    registry: &mut Registry,
    cache: Arc<BufferCache>,
    clock: Arc<dyn Clock>,
) -> Result<()> {
    registry.register_filesystem(FS_NAME, move || {
        Box::new(Ext2FileSystem::new(Arc::clone(&cache), Arc::clone(&clock))) as Box<dyn FileSystem>
    })
}
