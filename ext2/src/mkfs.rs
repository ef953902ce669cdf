//! 在块设备上建立新的 ext2 文件系统
//!
//! 每个块组依次为超级块、组描述符表、块位图、inode 位图与 inode 表，
//! 其后是数据块。0号组的首个数据块存放根目录。
//! 不足以容纳上述元数据和至少一个数据块的末尾组被舍去。

use alloc::{sync::Arc, vec, vec::Vec};

use block_cache::{BufferCache, Intent};
use block_dev::BlockDevice;
use log::info;
use vfs::{Error, Result};

use crate::{
    ROOT_INO,
    layout::{
        DirRecord, DiskInode, FileType, GROUP_DESC_SIZE, GroupDesc, INODE_SIZE, Mode,
        SUPER_OFFSET, SUPER_SIZE, SuperBlock, bitmap, encode,
    },
};

/// 格式化参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatOptions {
    /// 块大小，1 KiB 到 64 KiB 之间的2的幂，且是扇区大小的整数倍
    pub block_size: usize,
    /// 每组的 inode 数，向上取整到 inode 表占满整块
    pub inodes_per_group: u32,
    /// 每组的块数，8的倍数
    pub blocks_per_group: u32,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            block_size: 1024,
            inodes_per_group: 512,
            blocks_per_group: 8192,
        }
    }
}

/// 组描述符中的计数为16位
const MAX_PER_GROUP: u32 = 0xFFF8;
/// 0号组中保留的 inode，编号 1..=10
const RESERVED_INODES: u32 = SuperBlock::GOOD_OLD_FIRST_INO - 1;

/// 经由缓存写入整块
struct Writer<'a> {
    dev: &'a Arc<dyn BlockDevice>,
    cache: &'a BufferCache,
    block_size: usize,
}

impl Writer<'_> {
    /// 把 `block` 清零后交给 `f` 填写
    fn fresh(&self, block: u32, f: impl FnOnce(&mut [u8]) -> Result<()>) -> Result<()> {
        self.cache
            .acquire(self.dev, block.into(), self.block_size, Intent::Write)?
            .map_mut(|data| {
                data.fill(0);
                f(data)
            })
    }
}

/// 一个块组的布局
struct Group {
    start: u32,
    size: u32,
    desc: GroupDesc,
    /// 自组首起被元数据占用的块数
    used: u32,
}

/// 格式化 `dev`，写入经过 `cache` 并在结束时全部写回
pub fn format(dev: &Arc<dyn BlockDevice>, cache: &BufferCache, opts: &FormatOptions) -> Result<()> {
    let block_size = opts.block_size;
    if !block_size.is_power_of_two()
        || !(1024..=1024 << 6).contains(&block_size)
        || block_size % dev.sector_size() != 0
    {
        return Err(Error::InvalidArgument);
    }
    let bits_per_block = (block_size * 8) as u32;
    let per_group_max = bits_per_block.min(MAX_PER_GROUP);

    let blocks_per_group = opts.blocks_per_group;
    if blocks_per_group == 0 || blocks_per_group % 8 != 0 || blocks_per_group > per_group_max {
        return Err(Error::InvalidArgument);
    }
    let inodes_per_block = (block_size / INODE_SIZE) as u32;
    let inodes_per_group = opts.inodes_per_group.next_multiple_of(inodes_per_block);
    if inodes_per_group <= RESERVED_INODES || inodes_per_group > per_group_max {
        return Err(Error::InvalidArgument);
    }
    let table_blocks = inodes_per_group / inodes_per_block;

    let device_blocks = dev.sector_count() * dev.sector_size() as u64 / block_size as u64;
    let total = u32::try_from(device_blocks).unwrap_or(u32::MAX);
    let first_data_block = (block_size == 1024) as u32;
    if total <= first_data_block {
        return Err(Error::NoSpace);
    }

    let gdt_len = |groups: u32| (groups as usize * GROUP_DESC_SIZE).div_ceil(block_size) as u32;
    // 超级块、组描述符表、两个位图与 inode 表
    let meta_len = |groups: u32| 1 + gdt_len(groups) + 2 + table_blocks;

    let mut group_count = (total - first_data_block).div_ceil(blocks_per_group);
    if blocks_per_group <= meta_len(group_count) {
        return Err(Error::InvalidArgument);
    }
    let last = total - first_data_block - (group_count - 1) * blocks_per_group;
    if last <= meta_len(group_count) {
        group_count -= 1;
    }
    if group_count == 0 {
        return Err(Error::NoSpace);
    }
    let blocks_count = total.min(first_data_block + group_count * blocks_per_group);
    let gdt_blocks = gdt_len(group_count);
    let overhead = meta_len(group_count);

    let groups: Vec<Group> = (0..group_count)
        .map(|index| {
            let start = first_data_block + index * blocks_per_group;
            let meta = start + 1 + gdt_blocks;
            let mut desc = GroupDesc::new(meta, meta + 1, meta + 2);
            // 0号组另有根目录的数据块
            let used = overhead + (index == 0) as u32;
            let size = (blocks_count - start).min(blocks_per_group);
            let reserved = if index == 0 { RESERVED_INODES } else { 0 };
            desc.free_blocks_count = (size - used) as u16;
            desc.free_inodes_count = (inodes_per_group - reserved) as u16;
            desc.used_dirs_count = (index == 0) as u16;
            Group {
                start,
                size,
                desc,
                used,
            }
        })
        .collect();

    let inodes_count = group_count * inodes_per_group;
    let mut sb = SuperBlock {
        inodes_count,
        blocks_count,
        r_blocks_count: 0,
        free_blocks_count: groups.iter().map(|group| group.size - group.used).sum(),
        free_inodes_count: inodes_count - RESERVED_INODES,
        first_data_block,
        log_block_size: (block_size / 1024).trailing_zeros(),
        log_frag_size: (block_size / 1024).trailing_zeros(),
        blocks_per_group,
        frags_per_group: blocks_per_group,
        inodes_per_group,
        mtime: 0,
        wtime: 0,
        mnt_count: 0,
        max_mnt_count: u16::MAX,
        magic: SuperBlock::MAGIC,
        state: SuperBlock::STATE_VALID,
        errors: SuperBlock::ERRORS_CONTINUE,
        minor_rev_level: 0,
        lastcheck: 0,
        checkinterval: 0,
        creator_os: 0,
        rev_level: SuperBlock::DYNAMIC_REV,
        def_resuid: 0,
        def_resgid: 0,
        first_ino: SuperBlock::GOOD_OLD_FIRST_INO,
        inode_size: INODE_SIZE as u16,
        block_group_nr: 0,
        feature_compat: 0,
        feature_incompat: SuperBlock::INCOMPAT_FILETYPE,
        feature_ro_compat: 0,
        uuid: [0; 16],
        volume_name: [0; 16],
    };

    let mut gdt = vec![0; gdt_blocks as usize * block_size];
    for (index, group) in groups.iter().enumerate() {
        let offset = index * GROUP_DESC_SIZE;
        encode(&group.desc, &mut gdt[offset..offset + GROUP_DESC_SIZE])?;
    }

    let writer = Writer {
        dev,
        cache,
        block_size,
    };

    for (index, group) in groups.iter().enumerate() {
        // 超级块与其副本
        sb.block_group_nr = index as u16;
        if index == 0 {
            // 保留卷首的引导块
            let block = (SUPER_OFFSET / block_size) as u64;
            let offset = SUPER_OFFSET % block_size;
            cache
                .acquire(dev, block, block_size, Intent::Read)?
                .map_mut(|data| {
                    data[offset..offset + SUPER_OFFSET].fill(0);
                    encode(&sb, &mut data[offset..offset + SUPER_SIZE])
                })?;
        } else {
            writer.fresh(group.start, |data| encode(&sb, &mut data[..SUPER_SIZE]))?;
        }

        for (i, chunk) in gdt.chunks(block_size).enumerate() {
            writer.fresh(group.start + 1 + i as u32, |data| {
                data.copy_from_slice(chunk);
                Ok(())
            })?;
        }

        writer.fresh(group.desc.block_bitmap, |bits| {
            bitmap::set_range(bits, 0..group.used as usize);
            bitmap::set_range(bits, group.size as usize..bits_per_block as usize);
            Ok(())
        })?;
        writer.fresh(group.desc.inode_bitmap, |bits| {
            if index == 0 {
                bitmap::set_range(bits, 0..RESERVED_INODES as usize);
            }
            bitmap::set_range(bits, inodes_per_group as usize..bits_per_block as usize);
            Ok(())
        })?;
        for block in 0..table_blocks {
            writer.fresh(group.desc.inode_table + block, |_| Ok(()))?;
        }
    }

    // 根目录
    let root_block = groups[0].start + overhead;
    let mut root = DiskInode::new(Mode::Directory, 0o755, 2, 0);
    root.block[0] = root_block;
    root.blocks = (block_size / 512) as u32;
    root.set_size(block_size as u64);

    let root_offset = (ROOT_INO - 1) as usize * INODE_SIZE;
    let table_block = groups[0].desc.inode_table + (root_offset / block_size) as u32;
    let in_block = root_offset % block_size;
    writer.fresh(table_block, |data| {
        encode(&root, &mut data[in_block..in_block + INODE_SIZE])
    })?;
    writer.fresh(root_block, |data| {
        DirRecord::new(ROOT_INO, 12, ".", FileType::Directory).write(data, 0, ".")?;
        DirRecord::new(ROOT_INO, block_size - 12, "..", FileType::Directory).write(data, 12, "..")
    })?;

    cache.flush_all(dev)?;
    info!(
        "formatted ext2: {blocks_count} blocks of {block_size} bytes, {inodes_count} inodes, {group_count} groups"
    );
    Ok(())
}
