use binrw::{BinRead, BinWrite};

/// 组描述符的字节数
pub const GROUP_DESC_SIZE: usize = 32;

/// 块组描述符，组描述符表紧随超级块所在的块之后
#[derive(Debug, Clone, Default, BinRead, BinWrite)]
#[brw(little)]
pub struct GroupDesc {
    /// 块位图所在块
    pub block_bitmap: u32,
    /// inode 位图所在块
    pub inode_bitmap: u32,
    /// inode 表的首块
    pub inode_table: u32,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    /// 本组内的目录数
    pub used_dirs_count: u16,
    _pad: u16,
    _reserved: [u8; 12],
}

impl GroupDesc {
    pub fn new(block_bitmap: u32, inode_bitmap: u32, inode_table: u32) -> Self {
        Self {
            block_bitmap,
            inode_bitmap,
            inode_table,
            ..Default::default()
        }
    }
}
