mod common;

use std::sync::Arc;

use block_cache::BufferCache;
use block_dev::{BlockDevice, PartitionDevice, PartitionTable, RamDisk};
use common::put_u32;
use ext2::FormatOptions;
use vfs::{Error, MountError, OpenFlag, PathError, Registry, TickClock, Vfs};

const DISK_SECTORS: u64 = 4096;
const PART_START: u32 = 64;
const PART_SECTORS: u32 = 2048;

fn kind(result: Result<impl Sized, PathError>) -> Error {
    match result {
        Ok(_) => panic!("expected an error"),
        Err(err) => err.error,
    }
}

/// 一块带 MBR 的磁盘，唯一的分区是 1 MiB 的 ext2
fn partitioned_disk() -> Arc<dyn BlockDevice> {
    let mut image = vec![0; 512 * DISK_SECTORS as usize];
    let at = 446;
    image[at + 4] = 0x83;
    put_u32(&mut image, at + 8, PART_START);
    put_u32(&mut image, at + 12, PART_SECTORS);
    image[510] = 0x55;
    image[511] = 0xAA;
    Arc::new(RamDisk::from_image(512, image))
}

fn ext2_partition(disk: &Arc<dyn BlockDevice>) -> Arc<dyn BlockDevice> {
    let table = PartitionTable::parse(disk.as_ref()).unwrap();
    let part = table.get(0).unwrap();
    Arc::new(PartitionDevice::new(Arc::clone(disk), part).unwrap())
}

fn vfs_with_ext2(cache: &Arc<BufferCache>) -> Vfs {
    let clock = Arc::new(TickClock::new());
    let mut registry = Registry::new();
    ext2::register(&mut registry, Arc::clone(cache), clock.clone()).unwrap();
    tmpfs::register(&mut registry, Default::default(), clock).unwrap();
    Vfs::new(registry, Some(Arc::clone(cache)))
}

#[test]
fn ext2_on_a_partition() {
    let disk = partitioned_disk();
    let part = ext2_partition(&disk);
    let cache = Arc::new(BufferCache::new(32));
    ext2::format(&part, &cache, &FormatOptions::default()).unwrap();

    let vfs = vfs_with_ext2(&cache);
    vfs.mount("/", "tmpfs", None).unwrap();
    vfs.mkdir("/data").unwrap();
    vfs.mount("/data", "ext2", Some(Arc::clone(&part))).unwrap();
    assert_eq!(1024, vfs.stat_fs("/data").unwrap().total_blocks);

    vfs.mkdir("/data/logs").unwrap();
    let mut file = vfs
        .open("/data/logs/boot.log", OpenFlag::Write | OpenFlag::Create)
        .unwrap();
    file.write_all(b"mounted").unwrap();

    assert_eq!(Error::Busy, kind(vfs.unmount("/data")));
    file.close().unwrap();
    vfs.unmount("/data").unwrap();

    // 分区之外的扇区保持不变
    let mut sector = [0; 512];
    disk.read_sectors(PART_START as u64 - 1, 1, &mut sector).unwrap();
    assert!(sector.iter().all(|&byte| byte == 0));
    disk.read_sectors((PART_START + PART_SECTORS) as u64, 1, &mut sector)
        .unwrap();
    assert!(sector.iter().all(|&byte| byte == 0));

    // 另一个缓存上重新挂载
    let vfs = vfs_with_ext2(&Arc::new(BufferCache::new(8)));
    vfs.mount("/", "ext2", Some(part)).unwrap();
    let mut text = Vec::new();
    vfs.open("/logs/boot.log", OpenFlag::Read.into())
        .unwrap()
        .read_to_end(&mut text)
        .unwrap();
    assert_eq!(b"mounted".to_vec(), text);
    assert_eq!(7, vfs.stat("/logs/boot.log").unwrap().size);
}

#[test]
fn mount_errors() {
    let cache = Arc::new(BufferCache::new(8));
    let vfs = vfs_with_ext2(&cache);

    assert_eq!(
        Error::Mount(MountError::NoDevice),
        kind(vfs.mount("/", "ext2", None))
    );
    let blank: Arc<dyn BlockDevice> = Arc::new(RamDisk::new(512, 256));
    assert_eq!(
        Error::Mount(MountError::InvalidSuperblock),
        kind(vfs.mount("/", "ext2", Some(blank)))
    );
    assert!(vfs.mounts().is_empty());
}

#[test]
fn shared_cache_across_mounts() {
    let cache = Arc::new(BufferCache::new(16));
    let first: Arc<dyn BlockDevice> = Arc::new(RamDisk::new(512, 512));
    let second: Arc<dyn BlockDevice> = Arc::new(RamDisk::new(512, 512));
    let opts = FormatOptions {
        inodes_per_group: 32,
        ..Default::default()
    };
    ext2::format(&first, &cache, &opts).unwrap();
    ext2::format(&second, &cache, &opts).unwrap();

    let vfs = vfs_with_ext2(&cache);
    vfs.mount("/", "ext2", Some(first)).unwrap();
    vfs.mkdir("/b").unwrap();
    vfs.mount("/b", "ext2", Some(second)).unwrap();

    for (path, text) in [("/a.txt", b"first"), ("/b/a.txt", b"other")] {
        let mut file = vfs
            .open(path, OpenFlag::Write | OpenFlag::Create)
            .unwrap();
        file.write_all(text).unwrap();
    }

    let mut buf = Vec::new();
    vfs.open("/a.txt", OpenFlag::Read.into())
        .unwrap()
        .read_to_end(&mut buf)
        .unwrap();
    assert_eq!(b"first".to_vec(), buf);
    buf.clear();
    vfs.open("/b/a.txt", OpenFlag::Read.into())
        .unwrap()
        .read_to_end(&mut buf)
        .unwrap();
    assert_eq!(b"other".to_vec(), buf);

    vfs.link("/b/a.txt", "/b/again.txt").unwrap();
    assert_eq!(2, vfs.stat("/b/again.txt").unwrap().links);
    assert_eq!(Error::InvalidArgument, kind(vfs.link("/b/a.txt", "/cross.txt")));

    vfs.sync().unwrap();
    vfs.unmount("/b").unwrap();
    vfs.unmount("/").unwrap();
}
