//! # 虚拟文件系统层
//!
//! 驱动通过 [`FileSystem`] 与 [`Inode`] 特质接入，
//! 以名称注册到 [`Registry`]；[`Vfs`] 维护挂载表，
//! 把路径分派给挂载在其上的文件系统。

#![no_std]

extern crate alloc;

mod dirent;
mod error;
mod file;
mod inode;
mod mount;
pub mod path;
mod registry;
mod stat;

pub use self::{
    dirent::{DirEntry, InodeKind, ReadDir},
    error::{Error, MountError, PathError, Result},
    file::{File, OpenFlag, OpenFlags, SeekFrom},
    inode::{Clock, FileSystem, Inode, TickClock, check_name},
    mount::{Mount, MountInfo, Vfs, VfsResult},
    registry::{Factory, Registry},
    stat::{FsStat, Stat},
};

/// 单个文件名的最大字节数
pub const NAME_MAX: usize = 255;

/// 符号链接目标的最大字节数
pub const PATH_MAX: usize = 4096;

/// 经由 [`Vfs`] 创建的文件与目录的权限位
pub const DEFAULT_FILE_MODE: u16 = 0o644;
pub const DEFAULT_DIR_MODE: u16 = 0o755;
