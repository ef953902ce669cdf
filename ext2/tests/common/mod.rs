#![allow(dead_code)]

use std::sync::Arc;

use block_cache::BufferCache;
use block_dev::{BlockDevice, RamDisk};
use ext2::{Ext2FileSystem, FormatOptions};
use vfs::{FileSystem, TickClock};

pub const BLOCK: usize = 1024;

/// 手工构造的 64 KiB 卷，1 KiB 的块，单个块组，16个 inode。
///
/// - 块1：超级块
/// - 块2：组描述符表
/// - 块3、4：块位图、inode 位图
/// - 块5、6：inode 表
/// - 块7：根目录，含文件 `a`（inode 11）
/// - 块8：`a` 的内容 `0123456789`
pub fn hand_built_image() -> Vec<u8> {
    let mut image = vec![0; 64 * BLOCK];

    let sb = BLOCK;
    put_u32(&mut image, sb, 16); // inodes_count
    put_u32(&mut image, sb + 4, 64); // blocks_count
    put_u32(&mut image, sb + 12, 55); // free_blocks_count
    put_u32(&mut image, sb + 16, 5); // free_inodes_count
    put_u32(&mut image, sb + 20, 1); // first_data_block
    put_u32(&mut image, sb + 32, 8192); // blocks_per_group
    put_u32(&mut image, sb + 36, 8192); // frags_per_group
    put_u32(&mut image, sb + 40, 16); // inodes_per_group
    put_u16(&mut image, sb + 56, 0xEF53);
    put_u16(&mut image, sb + 58, 1); // state
    put_u32(&mut image, sb + 76, 1); // rev_level
    put_u32(&mut image, sb + 84, 11); // first_ino
    put_u16(&mut image, sb + 88, 128); // inode_size
    put_u32(&mut image, sb + 96, 2); // incompat: filetype

    let gdt = 2 * BLOCK;
    put_u32(&mut image, gdt, 3);
    put_u32(&mut image, gdt + 4, 4);
    put_u32(&mut image, gdt + 8, 5);
    put_u16(&mut image, gdt + 12, 55);
    put_u16(&mut image, gdt + 14, 5);
    put_u16(&mut image, gdt + 16, 1);

    // 块1..=8占用，第63位之后为填充
    let block_bitmap = 3 * BLOCK;
    image[block_bitmap] = 0xFF;
    image[block_bitmap + 7] = 0x80;
    image[block_bitmap + 8..block_bitmap + BLOCK].fill(0xFF);

    // inode 1..=11占用，第16位之后为填充
    let inode_bitmap = 4 * BLOCK;
    image[inode_bitmap] = 0xFF;
    image[inode_bitmap + 1] = 0x07;
    image[inode_bitmap + 2..inode_bitmap + BLOCK].fill(0xFF);

    put_inode(&mut image, 2, 0x41ED, 1024, 2, 7);
    put_inode(&mut image, 11, 0x81A4, 10, 1, 8);

    let root = 7 * BLOCK;
    put_record(&mut image, root, 2, 12, ".", 2);
    put_record(&mut image, root + 12, 2, 12, "..", 2);
    put_record(&mut image, root + 24, 11, 1000, "a", 1);

    image[8 * BLOCK..8 * BLOCK + 10].copy_from_slice(b"0123456789");
    image
}

/// inode 表始于块5
pub fn inode_offset(ino: usize) -> usize {
    5 * BLOCK + (ino - 1) * 128
}

fn put_inode(image: &mut [u8], ino: usize, mode: u16, size: u32, links: u16, block: u32) {
    let at = inode_offset(ino);
    put_u16(image, at, mode);
    put_u32(image, at + 4, size);
    put_u16(image, at + 26, links);
    put_u32(image, at + 28, (BLOCK / 512) as u32);
    put_u32(image, at + 40, block);
}

pub fn put_record(image: &mut [u8], at: usize, ino: u32, rec_len: u16, name: &str, file_type: u8) {
    put_u32(image, at, ino);
    put_u16(image, at + 4, rec_len);
    image[at + 6] = name.len() as u8;
    image[at + 7] = file_type;
    image[at + 8..at + 8 + name.len()].copy_from_slice(name.as_bytes());
}

pub fn put_u16(image: &mut [u8], at: usize, value: u16) {
    image[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

pub fn put_u32(image: &mut [u8], at: usize, value: u32) {
    image[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

pub fn device(image: Vec<u8>) -> Arc<dyn BlockDevice> {
    Arc::new(RamDisk::from_image(512, image))
}

pub fn new_fs(cache: &Arc<BufferCache>) -> Ext2FileSystem {
    Ext2FileSystem::new(Arc::clone(cache), Arc::new(TickClock::new()))
}

/// 在新的缓存上挂载
pub fn mount(dev: &Arc<dyn BlockDevice>) -> Ext2FileSystem {
    let fs = new_fs(&Arc::new(BufferCache::new(16)));
    fs.mount(Some(Arc::clone(dev))).unwrap();
    fs
}

/// 格式化一个 `blocks` 块的内存盘
pub fn formatted(blocks: usize, opts: FormatOptions) -> Arc<dyn BlockDevice> {
    let dev: Arc<dyn BlockDevice> =
        Arc::new(RamDisk::new(512, (blocks * opts.block_size / 512) as u64));
    ext2::format(&dev, &BufferCache::new(16), &opts).unwrap();
    dev
}

pub fn names(dir: &Arc<dyn vfs::Inode>) -> Vec<String> {
    vfs::ReadDir::new(Arc::clone(dir))
        .map(|entry| entry.unwrap().name)
        .collect()
}
