use alloc::{string::String, sync::Arc, vec::Vec};
use core::fmt;

use enumflags2::{BitFlags, bitflags};

use crate::{
    Error, Inode, PathError, ReadDir, Stat,
    mount::{OpenRef, VfsResult},
};

#[rustfmt::skip]
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFlag {
    Read     = 0b0000_0001,
    Write    = 0b0000_0010,
    /// 文件不存在时创建
    Create   = 0b0000_0100,
    /// 以写方式打开时先清空
    Truncate = 0b0000_1000,
    /// 每次写入前移到文件末尾
    Append   = 0b0001_0000,
}

pub type OpenFlags = BitFlags<OpenFlag>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFrom {
    Start(u64),
    End(i64),
    Current(i64),
}

/// 打开的文件或目录。存活期间占用所在挂载点，不能卸载。
pub struct File {
    path: String,
    inode: Arc<dyn Inode>,
    /// **文件**内的偏移量
    offset: u64,
    readable: bool,
    writable: bool,
    append: bool,
    open: OpenRef,
}

impl File {
    pub(crate) fn new(
        path: String,
        inode: Arc<dyn Inode>,
        flags: BitFlags<OpenFlag>,
        open: OpenRef,
    ) -> Self {
        let writable = flags.contains(OpenFlag::Write);
        Self {
            path,
            inode,
            offset: 0,
            // 没有读写标志时只读
            readable: flags.contains(OpenFlag::Read) || !writable,
            writable,
            append: flags.contains(OpenFlag::Append),
            open,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn inode(&self) -> &Arc<dyn Inode> {
        &self.inode
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize> {
        if !self.readable {
            return Err(self.error(Error::InvalidArgument));
        }
        if self.inode.kind().is_dir() {
            return Err(self.error(Error::IsADirectory));
        }

        let read = self
            .inode
            .read_at(self.offset, buf)
            .map_err(|err| self.error(err))?;
        self.offset += read as u64;
        Ok(read)
    }

    /// 读到文件末尾，返回读取的字节数
    pub fn read_to_end(&mut self, out: &mut Vec<u8>) -> VfsResult<usize> {
        let mut chunk = [0; 512];
        let mut total = 0;
        loop {
            let read = self.read(&mut chunk)?;
            if read == 0 {
                return Ok(total);
            }
            out.extend_from_slice(&chunk[..read]);
            total += read;
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> VfsResult<usize> {
        if !self.writable {
            return Err(self.error(Error::InvalidArgument));
        }
        if self.append {
            self.offset = self.stat()?.size;
        }

        let written = self
            .inode
            .write_at(self.offset, buf)
            .map_err(|err| self.error(err))?;
        self.offset += written as u64;
        Ok(written)
    }

    /// 写完整个 `buf`，写不进时返回 [`Error::NoSpace`]
    pub fn write_all(&mut self, mut buf: &[u8]) -> VfsResult<()> {
        while !buf.is_empty() {
            match self.write(buf)? {
                0 => return Err(self.error(Error::NoSpace)),
                n => buf = &buf[n..],
            }
        }
        Ok(())
    }

    pub fn seek(&mut self, pos: SeekFrom) -> VfsResult<u64> {
        let (base, delta) = match pos {
            SeekFrom::Start(offset) => (0, offset as i128),
            SeekFrom::End(delta) => (self.stat()?.size, delta as i128),
            SeekFrom::Current(delta) => (self.offset, delta as i128),
        };
        let offset = base as i128 + delta;
        if !(0..=u64::MAX as i128).contains(&offset) {
            return Err(self.error(Error::InvalidArgument));
        }

        self.offset = offset as u64;
        Ok(self.offset)
    }

    pub fn stat(&self) -> VfsResult<Stat> {
        self.inode.stat().map_err(|err| self.error(err))
    }

    pub fn truncate(&self, size: u64) -> VfsResult<()> {
        if !self.writable {
            return Err(self.error(Error::InvalidArgument));
        }
        self.inode.truncate(size).map_err(|err| self.error(err))
    }

    /// 列出目录的内容，列举期间同样占用挂载点
    pub fn read_dir(&self) -> VfsResult<ReadDir> {
        if !self.inode.kind().is_dir() {
            return Err(self.error(Error::NotADirectory));
        }
        Ok(ReadDir::pinned(Arc::clone(&self.inode), self.open.clone()))
    }

    /// 同步后关闭；直接丢弃句柄也会释放挂载点，只是不同步
    pub fn close(self) -> VfsResult<()> {
        self.inode.sync().map_err(|err| self.error(err))
    }

    fn error(&self, error: Error) -> PathError {
        PathError::new(self.path.as_str(), error)
    }
}

impl fmt::Debug for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("File")
            .field("path", &self.path)
            .field("offset", &self.offset)
            .field("readable", &self.readable)
            .field("writable", &self.writable)
            .finish_non_exhaustive()
    }
}
