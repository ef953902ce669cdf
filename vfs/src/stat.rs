use crate::InodeKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    /// Inode number
    pub ino: u64,
    pub kind: InodeKind,
    /// 权限位
    pub mode: u16,
    /// File size
    pub size: u64,
    pub links: u32,
    /// Occupying blocks, in 512-byte units
    pub blocks: u64,
    /// Optimal I/O block size
    pub block_size: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
}

/// 整个文件系统的统计信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStat {
    pub block_size: u64,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub total_inodes: u64,
    pub free_inodes: u64,
    pub max_name_len: usize,
}
