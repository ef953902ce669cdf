//! 目录内容的查找与修改
//!
//! 目录的数据块被目录项首尾相接地铺满，目录大小总是块大小的整数倍。
//! 删除的目录项并入前一项；块内首项被删除时仅把 inode 编号清零。

use alloc::string::String;

use block_cache::Intent;
use log::error;
use vfs::{Error, Result};

use crate::{
    layout::{DirRecord, DiskInode, FileType, rec_size},
    volume::Volume,
};

/// 逐个解析一个目录块中的目录项，出错后停止
struct Records<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Records<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }
}

impl<'a> Iterator for Records<'a> {
    /// 目录项在块内的偏移、头部与名字
    type Item = Result<(usize, DirRecord, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }

        let offset = self.offset;
        match DirRecord::parse(self.data, offset) {
            Ok((record, name)) => {
                self.offset += record.rec_len();
                Some(Ok((offset, record, name)))
            }
            Err(err) => {
                self.offset = self.data.len();
                Some(Err(err))
            }
        }
    }
}

/// 目录读出的一项，名字中的非法 UTF-8 被替换
#[derive(Debug)]
pub struct RawEntry {
    pub ino: u32,
    pub file_type: u8,
    pub name: String,
}

fn block_count(vol: &Volume, dir: &DiskInode) -> Result<u64> {
    let block_size = vol.block_size() as u64;
    if dir.size() % block_size != 0 {
        error!("directory size {} is not a whole number of blocks", dir.size());
        return Err(Error::CorruptFilesystem);
    }
    Ok(dir.size() / block_size)
}

/// 目录的第 `index` 个数据块，目录中不应有空洞
fn dir_block(vol: &Volume, dir: &DiskInode, index: u64) -> Result<u64> {
    match dir.block_id(vol, index)? {
        0 => {
            error!("hole at block {index} of a directory");
            Err(Error::CorruptFilesystem)
        }
        block => Ok(block.into()),
    }
}

/// 查找名为 `name` 的目录项，返回其 inode 编号与文件类型
pub fn find_entry(vol: &Volume, dir: &DiskInode, name: &str) -> Result<Option<(u32, u8)>> {
    for index in 0..block_count(vol, dir)? {
        let block = dir_block(vol, dir, index)?;
        let found = vol.acquire(block, Intent::Read)?.map(|data| -> Result<_> {
            for record in Records::new(data) {
                let (_, record, record_name) = record?;
                if record.ino != 0 && record_name == name.as_bytes() {
                    return Ok(Some((record.ino, record.file_type)));
                }
            }
            Ok(None)
        })?;

        if found.is_some() {
            return Ok(found);
        }
    }

    Ok(None)
}

/// 插入目录项。优先复用空闲的目录项或已有目录项名字之后的空间，
/// 都不够时在目录末尾追加一块。
pub fn add_entry(
    vol: &Volume,
    dir: &mut DiskInode,
    goal: u32,
    name: &str,
    ino: u32,
    file_type: FileType,
) -> Result<()> {
    let need = rec_size(name.len());
    let file_type = if vol.has_filetype() {
        file_type
    } else {
        FileType::Unknown
    };

    for index in 0..block_count(vol, dir)? {
        let block = dir_block(vol, dir, index)?;
        let guard = vol.acquire(block, Intent::Read)?;
        let spot = guard.map(|data| -> Result<_> {
            for record in Records::new(data) {
                let (offset, record, _) = record?;
                let fits = if record.ino == 0 {
                    record.rec_len() >= need
                } else {
                    record.slack() >= need
                };
                if fits {
                    return Ok(Some((offset, record)));
                }
            }
            Ok(None)
        })?;
        let Some((offset, mut record)) = spot else {
            continue;
        };

        return guard.map_mut(|data| {
            if record.ino == 0 {
                return DirRecord::new(ino, record.rec_len(), name, file_type).write(data, offset, name);
            }
            // 切下名字之后的空间
            let used = rec_size(record.name_len as usize);
            let rest = record.rec_len() - used;
            record.set_rec_len(used);
            record.write_header(data, offset)?;
            DirRecord::new(ino, rest, name, file_type).write(data, offset + used, name)
        });
    }

    let index = block_count(vol, dir)?;
    let block = dir.alloc_block_id(vol, index, goal)?;
    let block_size = vol.block_size();
    dir.set_size((index + 1) * block_size as u64);
    vol.acquire(block.into(), Intent::Read)?
        .map_mut(|data| DirRecord::new(ino, block_size, name, file_type).write(data, 0, name))
}

/// 删除名为 `name` 的目录项，返回其 inode 编号与文件类型
pub fn remove_entry(vol: &Volume, dir: &DiskInode, name: &str) -> Result<(u32, u8)> {
    for index in 0..block_count(vol, dir)? {
        let block = dir_block(vol, dir, index)?;
        let guard = vol.acquire(block, Intent::Read)?;
        let spot = guard.map(|data| -> Result<_> {
            let mut prev = None;
            for record in Records::new(data) {
                let (offset, record, record_name) = record?;
                if record.ino != 0 && record_name == name.as_bytes() {
                    return Ok(Some((prev, offset, record)));
                }
                prev = Some((offset, record));
            }
            Ok(None)
        })?;
        let Some((prev, offset, record)) = spot else {
            continue;
        };

        guard.map_mut(|data| match prev {
            Some((prev_offset, mut prev)) => {
                prev.set_rec_len(prev.rec_len() + record.rec_len());
                prev.write_header(data, prev_offset)
            }
            None => {
                let mut freed = record.clone();
                freed.ino = 0;
                freed.write_header(data, offset)
            }
        })?;
        return Ok((record.ino, record.file_type));
    }

    Err(Error::NotFound)
}

/// 除 `.` 与 `..` 外没有其他目录项
pub fn is_empty(vol: &Volume, dir: &DiskInode) -> Result<bool> {
    for index in 0..block_count(vol, dir)? {
        let block = dir_block(vol, dir, index)?;
        let empty = vol.acquire(block, Intent::Read)?.map(|data| -> Result<bool> {
            for record in Records::new(data) {
                let (_, record, name) = record?;
                if record.ino != 0 && name != b"." && name != b".." {
                    return Ok(false);
                }
            }
            Ok(true)
        })?;

        if !empty {
            return Ok(false);
        }
    }

    Ok(true)
}

/// 自字节偏移 `cursor` 起的下一个目录项，连同其后的偏移。
/// 游标落在目录项中间时从下一个目录项开始。
pub fn entry_at(vol: &Volume, dir: &DiskInode, cursor: usize) -> Result<Option<(RawEntry, usize)>> {
    let block_size = vol.block_size() as u64;
    let size = block_count(vol, dir)? * block_size;
    let mut cursor = cursor as u64;

    while cursor < size {
        let index = cursor / block_size;
        let start = (cursor % block_size) as usize;
        let block = dir_block(vol, dir, index)?;
        let found = vol.acquire(block, Intent::Read)?.map(|data| -> Result<_> {
            for record in Records::new(data) {
                let (offset, record, name) = record?;
                if offset < start || record.ino == 0 || name == b"." || name == b".." {
                    continue;
                }
                let entry = RawEntry {
                    ino: record.ino,
                    file_type: record.file_type,
                    name: String::from_utf8_lossy(name).into_owned(),
                };
                return Ok(Some((entry, offset + record.rec_len())));
            }
            Ok(None)
        })?;

        if let Some((entry, end)) = found {
            return Ok(Some((entry, (index * block_size) as usize + end)));
        }
        cursor = (index + 1) * block_size;
    }

    Ok(None)
}
