use binrw::{BinRead, BinWrite};
use log::error;
use vfs::{Error, Result};

/// 超级块在卷内的字节偏移
pub const SUPER_OFFSET: usize = 1024;
/// 驱动读写的超级块前缀长度，其后的字段原样保留
pub const SUPER_SIZE: usize = 136;

/// 超级块，记录整个卷的参数。
/// 位于卷的第1024字节处，每个块组开头有一份副本。
#[derive(Debug, Clone, BinRead, BinWrite)]
#[brw(little)]
pub struct SuperBlock {
    /// inode 总数
    pub inodes_count: u32,
    /// 块总数
    pub blocks_count: u32,
    /// 保留给超级用户的块数
    pub r_blocks_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    /// 首个数据块的编号，块大小为1 KiB 时为1，否则为0
    pub first_data_block: u32,
    /// 块大小为 `1024 << log_block_size`
    pub log_block_size: u32,
    pub log_frag_size: u32,
    pub blocks_per_group: u32,
    pub frags_per_group: u32,
    pub inodes_per_group: u32,
    /// 最近一次挂载的时间
    pub mtime: u32,
    /// 最近一次写入的时间
    pub wtime: u32,
    pub mnt_count: u16,
    pub max_mnt_count: u16,
    /// 恒为 [`SuperBlock::MAGIC`]
    pub magic: u16,
    pub state: u16,
    /// 检测到错误时的行为
    pub errors: u16,
    pub minor_rev_level: u16,
    pub lastcheck: u32,
    pub checkinterval: u32,
    pub creator_os: u32,
    /// 0为初版，1为动态版本
    pub rev_level: u32,
    pub def_resuid: u16,
    pub def_resgid: u16,

    /*
     * 以下字段仅对动态版本有意义
     */
    /// 首个非保留的 inode
    pub first_ino: u32,
    pub inode_size: u16,
    /// 此副本所在的块组
    pub block_group_nr: u16,
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,
    pub uuid: [u8; 16],
    pub volume_name: [u8; 16],
}

impl SuperBlock {
    pub const MAGIC: u16 = 0xEF53;

    /// 卷在上次卸载时是干净的
    pub const STATE_VALID: u16 = 1;
    /// 出错时继续运行
    pub const ERRORS_CONTINUE: u16 = 1;

    /// 目录项带有文件类型
    pub const INCOMPAT_FILETYPE: u32 = 0x0002;
    /// 驱动认识的不兼容特性
    const INCOMPAT_SUPPORTED: u32 = Self::INCOMPAT_FILETYPE;

    pub const GOOD_OLD_REV: u32 = 0;
    pub const DYNAMIC_REV: u32 = 1;
    /// 初版的首个非保留 inode
    pub const GOOD_OLD_FIRST_INO: u32 = 11;
    pub const GOOD_OLD_INODE_SIZE: u16 = 128;

    /// 块大小最多为 `1024 << 6`，即64 KiB
    const MAX_LOG_BLOCK_SIZE: u32 = 6;

    /// 检查各字段是否自洽，挂载前调用
    pub fn validate(&self) -> Result<()> {
        let fail = |what: &str| {
            error!("bad superblock: {what}");
            Err(Error::CorruptFilesystem)
        };

        if self.magic != Self::MAGIC {
            return fail("magic");
        }
        if self.inodes_count == 0
            || self.blocks_count == 0
            || self.blocks_per_group == 0
            || self.inodes_per_group == 0
        {
            return fail("zero count");
        }
        if self.log_block_size > Self::MAX_LOG_BLOCK_SIZE {
            return fail("block size");
        }

        let bits_per_block = self.block_size() as u32 * 8;
        if self.blocks_per_group > bits_per_block || self.inodes_per_group > bits_per_block {
            return fail("per-group count exceeds one bitmap block");
        }
        if self.first_data_block != (self.block_size() == 1024) as u32 {
            return fail("first data block");
        }
        if self.first_data_block >= self.blocks_count {
            return fail("no data blocks");
        }
        if u64::from(self.inodes_per_group) * self.group_count() < u64::from(self.inodes_count) {
            return fail("inode count exceeds groups");
        }
        if self.free_blocks_count > self.blocks_count || self.free_inodes_count > self.inodes_count
        {
            return fail("free count exceeds total");
        }

        if self.rev_level >= Self::DYNAMIC_REV {
            let inode_size = self.inode_size as usize;
            if inode_size < Self::GOOD_OLD_INODE_SIZE as usize
                || !inode_size.is_power_of_two()
                || inode_size > self.block_size()
            {
                return fail("inode size");
            }
            if self.first_ino <= crate::ROOT_INO || self.first_ino > self.inodes_count {
                return fail("first inode");
            }
            let unknown = self.feature_incompat & !Self::INCOMPAT_SUPPORTED;
            if unknown != 0 {
                error!("unsupported incompatible features {unknown:#x}");
                return Err(Error::CorruptFilesystem);
            }
        }

        Ok(())
    }

    pub fn block_size(&self) -> usize {
        1024 << self.log_block_size
    }

    pub fn group_count(&self) -> u64 {
        u64::from(self.blocks_count - self.first_data_block).div_ceil(u64::from(self.blocks_per_group))
    }

    pub fn inode_size(&self) -> usize {
        if self.rev_level == Self::GOOD_OLD_REV {
            Self::GOOD_OLD_INODE_SIZE as usize
        } else {
            self.inode_size as usize
        }
    }

    pub fn first_ino(&self) -> u32 {
        if self.rev_level == Self::GOOD_OLD_REV {
            Self::GOOD_OLD_FIRST_INO
        } else {
            self.first_ino
        }
    }

    /// 目录项的第8字节是否为文件类型
    pub fn has_filetype(&self) -> bool {
        self.rev_level >= Self::DYNAMIC_REV
            && self.feature_incompat & Self::INCOMPAT_FILETYPE != 0
    }
}
