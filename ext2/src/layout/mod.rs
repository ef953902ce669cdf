//! 磁盘上的数据结构，全部为小端序

pub mod bitmap;
mod dir_entry;
mod group;
mod inode;
mod super_block;

use binrw::{
    BinRead, BinWrite,
    io::Cursor,
    meta::{ReadEndian, WriteEndian},
};
use log::error;
use vfs::{Error, Result};

pub use self::{
    dir_entry::{DirRecord, FileType, rec_size},
    group::{GROUP_DESC_SIZE, GroupDesc},
    inode::{DiskInode, INODE_SIZE, Mode},
    super_block::{SUPER_OFFSET, SUPER_SIZE, SuperBlock},
};

/// 从 `bytes` 开头解出一个结构
pub fn decode<T>(bytes: &[u8]) -> Result<T>
where
    T: ReadEndian + for<'a> BinRead<Args<'a> = ()>,
{
    T::read(&mut Cursor::new(bytes)).map_err(|err| {
        error!("malformed on-disk structure: {err}");
        Error::CorruptFilesystem
    })
}

/// 把结构写到 `bytes` 开头，其余字节不动
pub fn encode<T>(value: &T, bytes: &mut [u8]) -> Result<()>
where
    T: WriteEndian + for<'a> BinWrite<Args<'a> = ()>,
{
    value.write(&mut Cursor::new(bytes)).map_err(|err| {
        error!("failed to encode on-disk structure: {err}");
        Error::InvalidArgument
    })
}
