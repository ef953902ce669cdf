//! 已挂载的卷：超级块、块组、位图与 inode 表的访问

use alloc::{collections::BTreeMap, sync::Arc, vec, vec::Vec};

use block_cache::{BufferCache, BufferGuard, Intent};
use block_dev::BlockDevice;
use log::{debug, error, info, warn};
use spin::{Mutex, RwLock};
use vfs::{Clock, Error, Result};

use crate::layout::{
    DiskInode, GROUP_DESC_SIZE, GroupDesc, INODE_SIZE, SUPER_OFFSET, SUPER_SIZE, SuperBlock,
    bitmap, decode, encode,
};

/// 仍有句柄的 inode
#[derive(Debug, Default)]
struct Live {
    handles: usize,
    /// 链接数已归零，最后一个句柄关闭时释放
    orphan: bool,
}

pub struct Volume {
    dev: Arc<dyn BlockDevice>,
    cache: Arc<BufferCache>,
    clock: Arc<dyn Clock>,
    /// 内存中的超级块，计数变化时写穿到缓存
    sb: Mutex<SuperBlock>,
    block_size: usize,
    group_count: u32,
    /// 超级块所在的块与块内偏移
    sb_block: u64,
    sb_offset: usize,
    /// 组描述符表的首块
    gdt_block: u64,
    blocks_count: u32,
    first_data_block: u32,
    blocks_per_group: u32,
    inodes_count: u32,
    inodes_per_group: u32,
    inode_size: usize,
    first_ino: u32,
    has_filetype: bool,
    /// 读操作共享，修改元数据的操作独占
    pub lock: RwLock<()>,
    live: Mutex<BTreeMap<u32, Live>>,
}

impl Volume {
    /// 读取并校验超级块
    pub fn open(
        dev: Arc<dyn BlockDevice>,
        cache: Arc<BufferCache>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let sb = probe(dev.as_ref())?;
        let block_size = sb.block_size();
        let sector_size = dev.sector_size();

        if block_size % sector_size != 0 {
            error!("block size {block_size} is not a multiple of sector size {sector_size}");
            return Err(Error::CorruptFilesystem);
        }
        let device_bytes = dev.sector_count() * sector_size as u64;
        if u64::from(sb.blocks_count) * block_size as u64 > device_bytes {
            error!(
                "{} blocks do not fit in a {device_bytes}-byte device",
                sb.blocks_count
            );
            return Err(Error::CorruptFilesystem);
        }

        let group_count = sb.group_count() as u32;
        let gdt_block = u64::from(sb.first_data_block) + 1;
        let gdt_blocks = (group_count as usize * GROUP_DESC_SIZE).div_ceil(block_size) as u64;
        if gdt_block + gdt_blocks > u64::from(sb.blocks_count) {
            error!("group descriptor table overruns the volume");
            return Err(Error::CorruptFilesystem);
        }

        info!(
            "ext2 volume: {} blocks of {block_size} bytes, {} inodes, {group_count} groups",
            sb.blocks_count, sb.inodes_count
        );

        Ok(Self {
            sb_block: (SUPER_OFFSET / block_size) as u64,
            sb_offset: SUPER_OFFSET % block_size,
            gdt_block,
            blocks_count: sb.blocks_count,
            first_data_block: sb.first_data_block,
            blocks_per_group: sb.blocks_per_group,
            inodes_count: sb.inodes_count,
            inodes_per_group: sb.inodes_per_group,
            inode_size: sb.inode_size(),
            first_ino: sb.first_ino(),
            has_filetype: sb.has_filetype(),
            block_size,
            group_count,
            sb: Mutex::new(sb),
            dev,
            cache,
            clock,
            lock: RwLock::new(()),
            live: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.dev
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// 一个间接块能容纳的块编号数
    pub fn ptrs_per_block(&self) -> u64 {
        (self.block_size / 4) as u64
    }

    pub fn has_filetype(&self) -> bool {
        self.has_filetype
    }

    pub fn now(&self) -> u32 {
        self.clock.now() as u32
    }

    pub fn super_block(&self) -> SuperBlock {
        self.sb.lock().clone()
    }

    pub fn acquire(&self, block: u64, intent: Intent) -> Result<BufferGuard<'_>> {
        Ok(self
            .cache
            .acquire(&self.dev, block, self.block_size, intent)?)
    }

    /// 超出卷的块编号说明结构已损坏，0原样返回
    pub fn check_block(&self, block: u32) -> Result<u32> {
        if block >= self.blocks_count {
            error!("block pointer {block} beyond {} blocks", self.blocks_count);
            return Err(Error::CorruptFilesystem);
        }
        Ok(block)
    }

    /// 间接块 `table` 中的第 `index` 项
    pub fn read_ptr(&self, table: u32, index: usize) -> Result<u32> {
        Ok(self
            .acquire(table.into(), Intent::Read)?
            .read_u32(index * 4))
    }

    pub fn write_ptr(&self, table: u32, index: usize, value: u32) -> Result<()> {
        self.acquire(table.into(), Intent::Read)?
            .write_u32(index * 4, value);
        Ok(())
    }

    pub fn read_ptrs(&self, table: u32) -> Result<Vec<u32>> {
        Ok(self.acquire(table.into(), Intent::Read)?.map(|data| {
            data.chunks_exact(4)
                .map(|ptr| u32::from_le_bytes([ptr[0], ptr[1], ptr[2], ptr[3]]))
                .collect()
        }))
    }

    /// 清零间接块中自第 `from` 项起的编号
    pub fn clear_ptrs(&self, table: u32, from: usize) -> Result<()> {
        self.acquire(table.into(), Intent::Read)?
            .map_mut(|data| data[from * 4..].fill(0));
        Ok(())
    }

    /// 以覆写意图取得新块并清零
    pub fn zero_block(&self, block: u32) -> Result<()> {
        self.acquire(block.into(), Intent::Write)?
            .map_mut(|data| data.fill(0));
        Ok(())
    }

    /// 修改内存中的超级块，并写穿到缓存
    pub fn update_super(&self, f: impl FnOnce(&mut SuperBlock)) -> Result<()> {
        let mut sb = self.sb.lock();
        f(&mut sb);
        let guard = self.acquire(self.sb_block, Intent::Read)?;
        guard.map_mut(|data| encode(&*sb, &mut data[self.sb_offset..self.sb_offset + SUPER_SIZE]))
    }

    /*
     * 块组
     */

    fn group_desc_pos(&self, group: u32) -> Result<(u64, usize)> {
        if group >= self.group_count {
            error!("group {group} out of {}", self.group_count);
            return Err(Error::CorruptFilesystem);
        }
        let byte = group as usize * GROUP_DESC_SIZE;
        Ok((
            self.gdt_block + (byte / self.block_size) as u64,
            byte % self.block_size,
        ))
    }

    pub fn group(&self, group: u32) -> Result<GroupDesc> {
        let (block, offset) = self.group_desc_pos(group)?;
        self.acquire(block, Intent::Read)?
            .map(|data| decode(&data[offset..offset + GROUP_DESC_SIZE]))
    }

    fn update_group(&self, group: u32, f: impl FnOnce(&mut GroupDesc)) -> Result<()> {
        let (block, offset) = self.group_desc_pos(group)?;
        let guard = self.acquire(block, Intent::Read)?;
        let mut desc: GroupDesc = guard.map(|data| decode(&data[offset..offset + GROUP_DESC_SIZE]))?;
        f(&mut desc);
        guard.map_mut(|data| encode(&desc, &mut data[offset..offset + GROUP_DESC_SIZE]))
    }

    /// 组内块数，最后一组可能不满
    fn blocks_in_group(&self, group: u32) -> u32 {
        let start = group * self.blocks_per_group;
        (self.blocks_count - self.first_data_block - start).min(self.blocks_per_group)
    }

    pub fn group_of_block(&self, block: u32) -> u32 {
        block.saturating_sub(self.first_data_block) / self.blocks_per_group
    }

    pub fn group_of_inode(&self, ino: u32) -> u32 {
        (ino - 1) / self.inodes_per_group
    }

    /*
     * 分配
     */

    /// 从 `goal` 组开始，按首次适配在块位图中分配一块
    pub fn alloc_block(&self, goal: u32) -> Result<u32> {
        for step in 0..self.group_count {
            let group = (goal + step) % self.group_count;
            let desc = self.group(group)?;
            if desc.free_blocks_count == 0 {
                continue;
            }

            let bitmap_block = self.check_block(desc.block_bitmap)?;
            let len = self.blocks_in_group(group) as usize;
            let found = self
                .acquire(bitmap_block.into(), Intent::Read)?
                .map_mut(|bits| bitmap::alloc(bits, 0, len));
            let Some(index) = found else {
                warn!("group {group} claims free blocks but its bitmap is full");
                continue;
            };

            self.update_group(group, |desc| desc.free_blocks_count -= 1)?;
            self.update_super(|sb| sb.free_blocks_count = sb.free_blocks_count.saturating_sub(1))?;
            let block = self.first_data_block + group * self.blocks_per_group + index as u32;
            debug!("allocated block {block}");
            return Ok(block);
        }

        Err(Error::NoSpace)
    }

    pub fn free_block(&self, block: u32) -> Result<()> {
        if block < self.first_data_block {
            error!("freeing reserved block {block}");
            return Err(Error::CorruptFilesystem);
        }
        let group = self.group_of_block(block);
        let index = ((block - self.first_data_block) % self.blocks_per_group) as usize;
        let desc = self.group(group)?;

        let was_set = self
            .acquire(self.check_block(desc.block_bitmap)?.into(), Intent::Read)?
            .map_mut(|bits| bitmap::free(bits, index));
        if !was_set {
            error!("block {block} freed twice");
            return Err(Error::CorruptFilesystem);
        }

        self.update_group(group, |desc| desc.free_blocks_count += 1)?;
        self.update_super(|sb| sb.free_blocks_count += 1)
    }

    /// 从 `goal` 组开始分配一个 inode，跳过保留的编号
    pub fn alloc_inode(&self, goal: u32, is_dir: bool) -> Result<u32> {
        for step in 0..self.group_count {
            let group = (goal + step) % self.group_count;
            let desc = self.group(group)?;
            if desc.free_inodes_count == 0 {
                continue;
            }

            let first = group * self.inodes_per_group;
            let from = self.first_ino.saturating_sub(first + 1) as usize;
            let len = self.inodes_count.saturating_sub(first).min(self.inodes_per_group) as usize;
            let found = self
                .acquire(self.check_block(desc.inode_bitmap)?.into(), Intent::Read)?
                .map_mut(|bits| bitmap::alloc(bits, from, len));
            let Some(index) = found else {
                warn!("group {group} claims free inodes but its bitmap is full");
                continue;
            };

            self.update_group(group, |desc| {
                desc.free_inodes_count -= 1;
                if is_dir {
                    desc.used_dirs_count += 1;
                }
            })?;
            self.update_super(|sb| sb.free_inodes_count = sb.free_inodes_count.saturating_sub(1))?;
            let ino = first + index as u32 + 1;
            debug!("allocated inode {ino}");
            return Ok(ino);
        }

        Err(Error::NoSpace)
    }

    pub fn free_inode(&self, ino: u32, is_dir: bool) -> Result<()> {
        self.check_ino(ino)?;
        let group = self.group_of_inode(ino);
        let index = ((ino - 1) % self.inodes_per_group) as usize;
        let desc = self.group(group)?;

        let was_set = self
            .acquire(self.check_block(desc.inode_bitmap)?.into(), Intent::Read)?
            .map_mut(|bits| bitmap::free(bits, index));
        if !was_set {
            error!("inode {ino} freed twice");
            return Err(Error::CorruptFilesystem);
        }

        self.update_group(group, |desc| {
            desc.free_inodes_count += 1;
            if is_dir {
                desc.used_dirs_count = desc.used_dirs_count.saturating_sub(1);
            }
        })?;
        self.update_super(|sb| sb.free_inodes_count += 1)
    }

    /*
     * inode 表
     */

    fn check_ino(&self, ino: u32) -> Result<()> {
        if ino == 0 || ino > self.inodes_count {
            error!("inode number {ino} out of range");
            return Err(Error::CorruptFilesystem);
        }
        Ok(())
    }

    /// inode 所在的块与块内偏移
    fn inode_pos(&self, ino: u32) -> Result<(u64, usize)> {
        self.check_ino(ino)?;
        let desc = self.group(self.group_of_inode(ino))?;
        let byte = ((ino - 1) % self.inodes_per_group) as usize * self.inode_size;
        let block = u64::from(desc.inode_table) + (byte / self.block_size) as u64;
        if block >= u64::from(self.blocks_count) {
            error!("inode table of inode {ino} beyond the volume");
            return Err(Error::CorruptFilesystem);
        }
        Ok((block, byte % self.block_size))
    }

    pub fn read_inode(&self, ino: u32) -> Result<DiskInode> {
        let (block, offset) = self.inode_pos(ino)?;
        self.acquire(block, Intent::Read)?
            .map(|data| decode(&data[offset..offset + INODE_SIZE]))
    }

    pub fn write_inode(&self, ino: u32, inode: &DiskInode) -> Result<()> {
        let (block, offset) = self.inode_pos(ino)?;
        self.acquire(block, Intent::Read)?
            .map_mut(|data| encode(inode, &mut data[offset..offset + INODE_SIZE]))
    }

    /*
     * 句柄与延迟释放
     */

    pub fn retain(&self, ino: u32) {
        self.live.lock().entry(ino).or_default().handles += 1;
    }

    /// 链接数归零后调用。仍有句柄时推迟到最后一个句柄关闭，返回是否推迟。
    pub fn defer_if_open(&self, ino: u32) -> bool {
        match self.live.lock().get_mut(&ino) {
            Some(live) => {
                live.orphan = true;
                true
            }
            None => false,
        }
    }

    /// 关闭一个句柄。调用者不得持有 [`Volume::lock`]。
    pub fn release(&self, ino: u32) -> Result<()> {
        let orphan = {
            let mut live = self.live.lock();
            let Some(entry) = live.get_mut(&ino) else {
                return Ok(());
            };
            entry.handles -= 1;
            if entry.handles > 0 {
                return Ok(());
            }
            live.remove(&ino).is_some_and(|entry| entry.orphan)
        };

        if orphan {
            let _guard = self.lock.write();
            self.destroy(ino)?;
        }
        Ok(())
    }

    /// 释放所有仍待释放的 inode，卸载时调用
    pub fn reap_orphans(&self) -> Result<()> {
        let orphans: Vec<u32> = self
            .live
            .lock()
            .iter_mut()
            .filter(|(_, live)| live.orphan)
            .map(|(&ino, live)| {
                live.orphan = false;
                ino
            })
            .collect();
        for ino in orphans {
            self.destroy(ino)?;
        }
        Ok(())
    }

    /// 释放链接数为0的 inode 及其数据块
    pub fn destroy(&self, ino: u32) -> Result<()> {
        let mut inode = self.read_inode(ino)?;
        if inode.links_count != 0 {
            warn!("inode {ino} regained links, not freed");
            return Ok(());
        }

        let is_dir = inode.is_dir();
        inode.clear_from(self, 0)?;
        inode.set_size(0);
        inode.dtime = self.now();
        self.write_inode(ino, &inode)?;
        self.free_inode(ino, is_dir)?;
        debug!("inode {ino} freed");
        Ok(())
    }

    /// 写回超级块与所有脏块
    pub fn flush(&self) -> Result<()> {
        let now = self.now();
        self.update_super(|sb| sb.wtime = now)?;
        Ok(self.cache.flush_all(&self.dev)?)
    }
}

/// 直接从设备读出覆盖字节 1024..2048 的扇区，解析超级块
fn probe(dev: &dyn BlockDevice) -> Result<SuperBlock> {
    let sector_size = dev.sector_size();
    let first = SUPER_OFFSET / sector_size;
    let end = (2 * SUPER_OFFSET).div_ceil(sector_size);
    if (end as u64) > dev.sector_count() {
        error!("device too small for an ext2 superblock");
        return Err(Error::CorruptFilesystem);
    }

    let mut raw = vec![0; (end - first) * sector_size];
    dev.read_sectors(first as u64, end - first, &mut raw)?;
    let offset = SUPER_OFFSET - first * sector_size;
    let sb: SuperBlock = decode(&raw[offset..offset + SUPER_SIZE])?;
    sb.validate()?;

    Ok(sb)
}
