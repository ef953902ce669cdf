//! inode 与其数据块的索引
//!
//! `block` 数组的前12项直接指向数据块，其后依次为
//! - 一级间接块：整个块连续存储**块编号**，每个编号都指向一个**数据块**
//! - 二级间接块：整个块连续存储**块编号**，每个编号都指向一个一级间接块
//! - 三级间接块：不支持
//!
//! 编号为0表示空洞，读出全零。
//!
//! ## 块索引编码
//!
//! - 剔去直接索引与一级索引的部分后，除以一级间接块的**可编号数量**，可得其在二级间接块中的位置
//! - 取模则得到一级间接块的内部索引

use alloc::vec::Vec;

use binrw::{BinRead, BinWrite};
use block_cache::Intent;
use log::{error, warn};
use vfs::{Error, InodeKind, Result};

use crate::volume::Volume;

/// 驱动读写的 inode 前缀长度
pub const INODE_SIZE: usize = 128;
/// `block` 数组的长度
pub const N_BLOCKS: usize = 15;

/// 直接索引数量
const DIRECT_COUNT: usize = 12;
/// 一级间接块在 `block` 中的位置
const INDIRECT1: usize = 12;
/// 二级间接块在 `block` 中的位置
const INDIRECT2: usize = 13;
const INDIRECT3: usize = 14;

/// 普通文件的最大字节数，大文件特性不启用
const MAX_FILE_SIZE: u64 = u32::MAX as u64;

/// `i_blocks` 的计数单位
const SECTOR: u64 = 512;

/// `mode` 的高4位，表示 inode 的类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Mode {
    Fifo = 0x1000,
    Char = 0x2000,
    Directory = 0x4000,
    Block = 0x6000,
    Regular = 0x8000,
    SymLink = 0xA000,
    Socket = 0xC000,
}

impl Mode {
    const MASK: u16 = 0xF000;
    /// 权限位
    pub const PERMISSIONS: u16 = 0o7777;

    fn from_bits(mode: u16) -> Option<Self> {
        Some(match mode & Self::MASK {
            0x1000 => Self::Fifo,
            0x2000 => Self::Char,
            0x4000 => Self::Directory,
            0x6000 => Self::Block,
            0x8000 => Self::Regular,
            0xA000 => Self::SymLink,
            0xC000 => Self::Socket,
            _ => return None,
        })
    }

    pub fn kind(self) -> InodeKind {
        match self {
            Self::Fifo => InodeKind::Fifo,
            Self::Char => InodeKind::Char,
            Self::Directory => InodeKind::Directory,
            Self::Block => InodeKind::Block,
            Self::Regular => InodeKind::Regular,
            Self::SymLink => InodeKind::SymLink,
            Self::Socket => InodeKind::Socket,
        }
    }
}

#[derive(Debug, Clone, Default, BinRead, BinWrite)]
#[brw(little)]
pub struct DiskInode {
    /// 类型与权限
    pub mode: u16,
    pub uid: u16,
    /// 大小的低32位
    size: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    /// 删除的时间
    pub dtime: u32,
    pub gid: u16,
    /// 硬链接个数
    pub links_count: u16,
    /// 占用的块数，以512字节计，包括间接块
    pub blocks: u32,
    pub flags: u32,
    _osd1: u32,
    pub block: [u32; N_BLOCKS],
    pub generation: u32,
    pub file_acl: u32,
    /// 普通文件大小的高32位
    size_high: u32,
    _faddr: u32,
    _osd2: [u8; 12],
}

/// 逻辑块索引在索引树中的位置
enum Slot {
    Direct(usize),
    Indirect1(usize),
    Indirect2(usize, usize),
}

fn locate(index: u64, per_block: u64) -> Option<Slot> {
    let direct = DIRECT_COUNT as u64;
    if index < direct {
        return Some(Slot::Direct(index as usize));
    }
    let index = index - direct;
    if index < per_block {
        return Some(Slot::Indirect1(index as usize));
    }
    let index = index - per_block;
    (index < per_block * per_block).then(|| {
        Slot::Indirect2((index / per_block) as usize, (index % per_block) as usize)
    })
}

impl DiskInode {
    pub fn new(mode: Mode, permissions: u16, links: u16, now: u32) -> Self {
        Self {
            mode: mode as u16 | (permissions & Mode::PERMISSIONS),
            links_count: links,
            atime: now,
            ctime: now,
            mtime: now,
            ..Default::default()
        }
    }

    pub fn file_mode(&self) -> Result<Mode> {
        Mode::from_bits(self.mode).ok_or_else(|| {
            error!("unknown inode type {:#x}", self.mode);
            Error::CorruptFilesystem
        })
    }

    pub fn kind(&self) -> Result<InodeKind> {
        self.file_mode().map(Mode::kind)
    }

    pub fn is_dir(&self) -> bool {
        Mode::from_bits(self.mode) == Some(Mode::Directory)
    }

    pub fn permissions(&self) -> u16 {
        self.mode & Mode::PERMISSIONS
    }

    pub fn size(&self) -> u64 {
        if Mode::from_bits(self.mode) == Some(Mode::Regular) {
            u64::from(self.size_high) << 32 | u64::from(self.size)
        } else {
            u64::from(self.size)
        }
    }

    /// 调用者保证不超过 `u32::MAX`
    pub fn set_size(&mut self, size: u64) {
        self.size = size as u32;
        self.size_high = 0;
    }

    pub fn touch(&mut self, now: u32) {
        self.mtime = now;
        self.ctime = now;
    }

    /// 内容直接存放在 `block` 数组里的符号链接
    fn is_fast_symlink(&self) -> bool {
        Mode::from_bits(self.mode) == Some(Mode::SymLink) && self.blocks == 0
    }

    /// 逻辑上 inode 指向一系列数据块，此处传入的是这些数据块的索引（逻辑索引），
    /// 然后返回其在卷上的块编号，0表示空洞
    pub fn block_id(&self, vol: &Volume, index: u64) -> Result<u32> {
        let Some(slot) = locate(index, vol.ptrs_per_block()) else {
            error!("block index {index} needs triple indirection");
            return Err(Error::CorruptFilesystem);
        };

        match slot {
            Slot::Direct(i) => vol.check_block(self.block[i]),
            Slot::Indirect1(i) => {
                let table = vol.check_block(self.block[INDIRECT1])?;
                if table == 0 {
                    return Ok(0);
                }
                vol.check_block(vol.read_ptr(table, i)?)
            }
            Slot::Indirect2(i, j) => {
                let table2 = vol.check_block(self.block[INDIRECT2])?;
                if table2 == 0 {
                    return Ok(0);
                }
                let table1 = vol.check_block(vol.read_ptr(table2, i)?)?;
                if table1 == 0 {
                    return Ok(0);
                }
                vol.check_block(vol.read_ptr(table1, j)?)
            }
        }
    }

    /// 同 [`DiskInode::block_id`]，但为空洞及沿途缺失的间接块分配新块。
    /// 新块从 `goal` 组开始寻找，内容为全零。
    pub fn alloc_block_id(&mut self, vol: &Volume, index: u64, goal: u32) -> Result<u32> {
        let Some(slot) = locate(index, vol.ptrs_per_block()) else {
            return Err(Error::NoSpace);
        };

        match slot {
            Slot::Direct(i) => {
                if vol.check_block(self.block[i])? == 0 {
                    self.block[i] = self.new_block(vol, goal)?;
                }
                Ok(self.block[i])
            }
            Slot::Indirect1(i) => {
                let table = self.root_table(vol, INDIRECT1, goal)?;
                self.child(vol, table, i, goal)
            }
            Slot::Indirect2(i, j) => {
                let table2 = self.root_table(vol, INDIRECT2, goal)?;
                let table1 = self.child(vol, table2, i, goal)?;
                self.child(vol, table1, j, goal)
            }
        }
    }

    fn root_table(&mut self, vol: &Volume, slot: usize, goal: u32) -> Result<u32> {
        if vol.check_block(self.block[slot])? == 0 {
            self.block[slot] = self.new_block(vol, goal)?;
        }
        Ok(self.block[slot])
    }

    /// 间接块 `table` 中第 `i` 项指向的块，缺失时分配
    fn child(&mut self, vol: &Volume, table: u32, i: usize, goal: u32) -> Result<u32> {
        let block = vol.check_block(vol.read_ptr(table, i)?)?;
        if block != 0 {
            return Ok(block);
        }

        let block = self.new_block(vol, goal)?;
        vol.write_ptr(table, i, block)?;
        Ok(block)
    }

    fn new_block(&mut self, vol: &Volume, goal: u32) -> Result<u32> {
        let block = vol.alloc_block(goal)?;
        if let Err(err) = vol.zero_block(block) {
            vol.free_block(block)?;
            return Err(err);
        }
        self.blocks += (vol.block_size() as u64 / SECTOR) as u32;
        Ok(block)
    }

    fn release(&mut self, vol: &Volume, block: u32) -> Result<()> {
        vol.free_block(vol.check_block(block)?)?;
        self.blocks = self
            .blocks
            .saturating_sub((vol.block_size() as u64 / SECTOR) as u32);
        Ok(())
    }

    /// 释放前 `keep` 个逻辑块之后的所有数据块，以及因此不再需要的间接块
    pub fn clear_from(&mut self, vol: &Volume, keep: u64) -> Result<()> {
        if self.is_fast_symlink() {
            return Ok(());
        }
        let per_block = vol.ptrs_per_block();

        for i in (keep.min(DIRECT_COUNT as u64) as usize)..DIRECT_COUNT {
            if self.block[i] != 0 {
                self.release(vol, self.block[i])?;
                self.block[i] = 0;
            }
        }

        let table = vol.check_block(self.block[INDIRECT1])?;
        if table != 0 {
            let from = keep.saturating_sub(DIRECT_COUNT as u64).min(per_block) as usize;
            self.clear_table(vol, table, from)?;
            if from == 0 {
                self.release(vol, table)?;
                self.block[INDIRECT1] = 0;
            }
        }

        let table2 = vol.check_block(self.block[INDIRECT2])?;
        if table2 != 0 {
            let from = keep.saturating_sub(DIRECT_COUNT as u64 + per_block);
            for (i, table1) in vol.read_ptrs(table2)?.into_iter().enumerate() {
                let table1 = vol.check_block(table1)?;
                let inner = from.saturating_sub(i as u64 * per_block).min(per_block) as usize;
                if table1 == 0 || inner == per_block as usize {
                    continue;
                }
                self.clear_table(vol, table1, inner)?;
                if inner == 0 {
                    self.release(vol, table1)?;
                    vol.write_ptr(table2, i, 0)?;
                }
            }
            if from == 0 {
                self.release(vol, table2)?;
                self.block[INDIRECT2] = 0;
            }
        }

        if self.block[INDIRECT3] != 0 {
            warn!("triple indirect block {} left in place", self.block[INDIRECT3]);
        }

        Ok(())
    }

    /// 释放间接块 `table` 中自第 `from` 项起指向的块
    fn clear_table(&mut self, vol: &Volume, table: u32, from: usize) -> Result<()> {
        let ptrs: Vec<u32> = vol.read_ptrs(table)?;
        if from > 0 && ptrs[from..].iter().any(|&ptr| ptr != 0) {
            vol.clear_ptrs(table, from)?;
        }
        for &block in &ptrs[from..] {
            if block != 0 {
                self.release(vol, block)?;
            }
        }
        Ok(())
    }

    /// 从 `offset` 处读取数据，越过文件末尾的部分不读
    pub fn read_at(&self, vol: &Volume, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let size = self.size();
        if offset >= size {
            return Ok(0);
        }
        let end = size.min(offset.saturating_add(buf.len() as u64));

        if self.is_fast_symlink() {
            let mut bytes = [0; N_BLOCKS * 4];
            for (chunk, ptr) in bytes.chunks_exact_mut(4).zip(self.block) {
                chunk.copy_from_slice(&ptr.to_le_bytes());
            }
            let end = (end as usize).min(bytes.len());
            let start = (offset as usize).min(end);
            let len = end - start;
            buf[..len].copy_from_slice(&bytes[start..start + len]);
            return Ok(len);
        }

        let block_size = vol.block_size() as u64;
        let mut pos = offset;
        let mut done = 0;
        while pos < end {
            let inner = (pos % block_size) as usize;
            let len = (block_size - inner as u64).min(end - pos) as usize;
            let dst = &mut buf[done..done + len];

            match self.block_id(vol, pos / block_size)? {
                0 => dst.fill(0),
                block => vol
                    .acquire(block.into(), Intent::Read)?
                    .map(|data| dst.copy_from_slice(&data[inner..inner + len])),
            }

            pos += len as u64;
            done += len;
        }

        Ok(done)
    }

    /// 在 `offset` 处写入，必要时分配块并扩大文件。
    /// 已写入部分数据后空间耗尽时返回已写入的字节数。
    pub fn write_at(&mut self, vol: &Volume, goal: u32, offset: u64, buf: &[u8]) -> Result<usize> {
        let end = offset
            .checked_add(buf.len() as u64)
            .filter(|&end| end <= MAX_FILE_SIZE)
            .ok_or(Error::NoSpace)?;

        let block_size = vol.block_size() as u64;
        let mut pos = offset;
        let mut done = 0;
        while pos < end {
            let inner = (pos % block_size) as usize;
            let len = (block_size - inner as u64).min(end - pos) as usize;

            let block = match self.alloc_block_id(vol, pos / block_size, goal) {
                Ok(block) => block,
                Err(Error::NoSpace) if done > 0 => break,
                Err(err) => return Err(err),
            };
            vol.acquire(block.into(), Intent::Read)?
                .map_mut(|data| data[inner..inner + len].copy_from_slice(&buf[done..done + len]));

            pos += len as u64;
            done += len;
        }

        if pos > self.size() {
            self.set_size(pos);
        }
        Ok(done)
    }
}
