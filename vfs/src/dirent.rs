use alloc::{string::String, sync::Arc};
use core::fmt;

use crate::{Inode, Result, mount::OpenRef};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Inode number
    pub ino: u64,
    pub kind: InodeKind,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum InodeKind {
    Block,
    Char,
    Directory,
    Fifo,
    Socket,
    SymLink,
    #[default]
    Regular,
}

impl InodeKind {
    pub fn is_dir(self) -> bool {
        self == Self::Directory
    }
}

/// 目录项的惰性序列，可经 [`ReadDir::rewind`] 从头再来。
///
/// 游标的含义由驱动决定，这里只负责保存与传回。
pub struct ReadDir {
    dir: Arc<dyn Inode>,
    cursor: usize,
    /// 出错后不再继续
    failed: bool,
    /// 经由挂载表打开时占用挂载点
    _open: Option<OpenRef>,
}

impl ReadDir {
    pub fn new(dir: Arc<dyn Inode>) -> Self {
        Self {
            dir,
            cursor: 0,
            failed: false,
            _open: None,
        }
    }

    pub(crate) fn pinned(dir: Arc<dyn Inode>, open: OpenRef) -> Self {
        Self {
            dir,
            cursor: 0,
            failed: false,
            _open: Some(open),
        }
    }

    pub fn rewind(&mut self) {
        self.cursor = 0;
        self.failed = false;
    }
}

impl Iterator for ReadDir {
    type Item = Result<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.dir.read_dir_at(self.cursor) {
            Ok(Some((entry, next))) => {
                self.cursor = next;
                Some(Ok(entry))
            }
            Ok(None) => None,
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

impl fmt::Debug for ReadDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadDir")
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}
