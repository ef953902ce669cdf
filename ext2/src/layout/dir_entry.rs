use binrw::{BinRead, BinWrite};
use log::error;
use vfs::{Error, InodeKind, Result};

use super::{decode, encode};

/// 目录项的定长头部，其后紧跟名字。
/// 一个目录块被若干目录项恰好铺满，`rec_len` 包含名字之后的空闲空间。
#[derive(Debug, Clone, BinRead, BinWrite)]
#[brw(little)]
pub struct DirRecord {
    /// 0表示空闲的目录项
    pub ino: u32,
    /// 到下一个目录项的字节数，经 [`DirRecord::rec_len`] 读取
    rec_len: u16,
    pub name_len: u8,
    /// 无文件类型特性时为名字长度的高8位
    pub file_type: u8,
}

/// 容纳名字长 `name_len` 的目录项所需的最小空间，按4字节对齐
pub fn rec_size(name_len: usize) -> usize {
    (DirRecord::HEADER + name_len + 3) & !3
}

impl DirRecord {
    pub const HEADER: usize = 8;
    /// 64 KiB 的块中，铺满整块的目录项长度记为此值
    const MAX_REC_LEN: u16 = u16::MAX;

    pub fn new(ino: u32, rec_len: usize, name: &str, file_type: FileType) -> Self {
        let mut record = Self {
            ino,
            rec_len: 0,
            name_len: name.len() as u8,
            file_type: file_type as u8,
        };
        record.set_rec_len(rec_len);
        record
    }

    pub fn rec_len(&self) -> usize {
        match self.rec_len {
            0 | Self::MAX_REC_LEN => 1 << 16,
            len => len as usize,
        }
    }

    pub fn set_rec_len(&mut self, len: usize) {
        self.rec_len = u16::try_from(len).unwrap_or(Self::MAX_REC_LEN);
    }

    /// 解析并校验 `block` 中 `offset` 处的目录项，返回它与它的名字
    pub fn parse(block: &[u8], offset: usize) -> Result<(Self, &[u8])> {
        let fail = |what: &str| {
            error!("bad directory record at {offset}: {what}");
            Err(Error::CorruptFilesystem)
        };

        if offset + Self::HEADER > block.len() {
            return fail("truncated header");
        }
        let record: Self = decode(&block[offset..])?;
        let rec_len = record.rec_len();
        if rec_len < Self::HEADER || rec_len % 4 != 0 {
            return fail("bad record length");
        }
        if offset + rec_len > block.len() {
            return fail("record overruns block");
        }
        let name_end = Self::HEADER + record.name_len as usize;
        if name_end > rec_len {
            return fail("name overruns record");
        }

        Ok((record, &block[offset + Self::HEADER..offset + name_end]))
    }

    /// 在 `offset` 处只写入头部
    pub fn write_header(&self, block: &mut [u8], offset: usize) -> Result<()> {
        encode(self, &mut block[offset..offset + Self::HEADER])
    }

    /// 在 `offset` 处写入头部与名字
    pub fn write(&self, block: &mut [u8], offset: usize, name: &str) -> Result<()> {
        self.write_header(block, offset)?;
        block[offset + Self::HEADER..offset + Self::HEADER + name.len()]
            .copy_from_slice(name.as_bytes());
        Ok(())
    }

    /// 名字之后可分给新目录项的空间
    pub fn slack(&self) -> usize {
        self.rec_len()
            .saturating_sub(rec_size(self.name_len as usize))
    }
}

/// 目录项中的文件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileType {
    Unknown = 0,
    Regular = 1,
    Directory = 2,
    Char = 3,
    Block = 4,
    Fifo = 5,
    Socket = 6,
    SymLink = 7,
}

impl FileType {
    pub fn from_kind(kind: InodeKind) -> Self {
        match kind {
            InodeKind::Regular => Self::Regular,
            InodeKind::Directory => Self::Directory,
            InodeKind::Char => Self::Char,
            InodeKind::Block => Self::Block,
            InodeKind::Fifo => Self::Fifo,
            InodeKind::Socket => Self::Socket,
            InodeKind::SymLink => Self::SymLink,
        }
    }

    /// 0或未知的取值返回空
    pub fn kind(raw: u8) -> Option<InodeKind> {
        Some(match raw {
            1 => InodeKind::Regular,
            2 => InodeKind::Directory,
            3 => InodeKind::Char,
            4 => InodeKind::Block,
            5 => InodeKind::Fifo,
            6 => InodeKind::Socket,
            7 => InodeKind::SymLink,
            _ => return None,
        })
    }
}
