use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};
use std::thread;
use std::time::Duration;

use block_cache::{BufferCache, Intent};
use block_dev::{BlockDevice, DeviceError, RamDisk};

const SECTOR: usize = 512;
const BLOCK: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Read(u64),
    Write(u64),
}

/// 记录每次读写的设备
struct TracingDevice {
    disk: RamDisk,
    ops: Mutex<Vec<Op>>,
    reads: AtomicUsize,
    read_delay: Option<Duration>,
    fail_reads: AtomicBool,
}

impl TracingDevice {
    fn new(sectors: u64) -> Arc<Self> {
        Arc::new(Self {
            disk: RamDisk::new(SECTOR, sectors),
            ops: Mutex::new(Vec::new()),
            reads: AtomicUsize::new(0),
            read_delay: None,
            fail_reads: AtomicBool::new(false),
        })
    }

    fn slow(sectors: u64, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            disk: RamDisk::new(SECTOR, sectors),
            ops: Mutex::new(Vec::new()),
            reads: AtomicUsize::new(0),
            read_delay: Some(delay),
            fail_reads: AtomicBool::new(false),
        })
    }

    fn ops(&self) -> Vec<Op> {
        self.ops.lock().unwrap().clone()
    }
}

impl BlockDevice for TracingDevice {
    fn sector_size(&self) -> usize {
        SECTOR
    }

    fn sector_count(&self) -> u64 {
        self.disk.sector_count()
    }

    fn read_sectors(&self, start: u64, count: usize, buf: &mut [u8]) -> Result<(), DeviceError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.ops.lock().unwrap().push(Op::Read(start));
        if let Some(delay) = self.read_delay {
            thread::sleep(delay);
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(DeviceError::IoFailure);
        }
        self.disk.read_sectors(start, count, buf)
    }

    fn write_sectors(&self, start: u64, count: usize, buf: &[u8]) -> Result<(), DeviceError> {
        self.ops.lock().unwrap().push(Op::Write(start));
        self.disk.write_sectors(start, count, buf)
    }
}

fn as_dyn(dev: &Arc<TracingDevice>) -> Arc<dyn BlockDevice> {
    dev.clone()
}

#[test]
fn unique_buffer_per_key() {
    let tracing = TracingDevice::new(64);
    let dev = as_dyn(&tracing);
    let cache = BufferCache::new(4);

    let first = cache.acquire(&dev, 3, BLOCK, Intent::Read).unwrap();
    let second = cache.acquire(&dev, 3, BLOCK, Intent::Read).unwrap();
    first.write_u32(8, 0xDEAD_BEEF);

    assert_eq!(0xDEAD_BEEF, second.read_u32(8));
    assert_eq!(1, tracing.reads.load(Ordering::SeqCst));
    let stats = cache.stats();
    assert_eq!((1, 1, 1), (stats.hits, stats.misses, stats.dirty));
}

#[test]
fn block_maps_to_sectors() {
    let tracing = TracingDevice::new(64);
    let dev = as_dyn(&tracing);
    let cache = BufferCache::new(4);

    drop(cache.acquire(&dev, 5, BLOCK, Intent::Read).unwrap());
    drop(cache.acquire(&dev, 5, 4096, Intent::Read));
    assert_eq!(vec![Op::Read(10)], tracing.ops());

    assert_eq!(
        DeviceError::InvalidArgument,
        cache.acquire(&dev, 0, 700, Intent::Read).unwrap_err()
    );
    assert_eq!(
        DeviceError::InvalidArgument,
        cache.acquire(&dev, 5, 4096, Intent::Read).unwrap_err()
    );
}

#[test]
fn dirty_round_trip_through_eviction() {
    let tracing = TracingDevice::new(64);
    let dev = as_dyn(&tracing);
    let cache = BufferCache::new(2);

    cache
        .acquire(&dev, 1, BLOCK, Intent::Read)
        .unwrap()
        .map_mut(|data| data[..5].copy_from_slice(b"hello"));
    drop(cache.acquire(&dev, 2, BLOCK, Intent::Read).unwrap());
    drop(cache.acquire(&dev, 3, BLOCK, Intent::Read).unwrap());

    let mut raw = [0; SECTOR];
    tracing.disk.read_sectors(2, 1, &mut raw).unwrap();
    assert_eq!(b"hello", &raw[..5]);

    let back = cache.acquire(&dev, 1, BLOCK, Intent::Read).unwrap();
    assert!(back.map(|data| data.starts_with(b"hello")));
    assert!(!back.is_dirty());
    assert_eq!(1, cache.stats().writebacks);
}

#[test]
fn capacity_one_evicts_before_admitting() {
    let tracing = TracingDevice::new(64);
    let dev = as_dyn(&tracing);
    let cache = BufferCache::new(1);

    let a = cache.acquire(&dev, 1, BLOCK, Intent::Read).unwrap();
    a.mark_dirty();
    drop(a);
    drop(cache.acquire(&dev, 2, BLOCK, Intent::Read).unwrap());

    assert_eq!(
        vec![Op::Read(2), Op::Write(2), Op::Read(4)],
        tracing.ops()
    );
    assert_eq!(1, cache.stats().evictions);
}

#[test]
fn least_recently_used_is_evicted() {
    let tracing = TracingDevice::new(64);
    let dev = as_dyn(&tracing);
    let cache = BufferCache::new(2);

    drop(cache.acquire(&dev, 1, BLOCK, Intent::Read).unwrap());
    drop(cache.acquire(&dev, 2, BLOCK, Intent::Read).unwrap());
    drop(cache.acquire(&dev, 1, BLOCK, Intent::Read).unwrap());
    drop(cache.acquire(&dev, 3, BLOCK, Intent::Read).unwrap());
    drop(cache.acquire(&dev, 1, BLOCK, Intent::Read).unwrap());

    // 块1仍在缓存中，块2被淘汰
    assert_eq!(
        vec![Op::Read(2), Op::Read(4), Op::Read(6)],
        tracing.ops()
    );
    assert_eq!(2, cache.stats().hits);
}

#[test]
fn write_intent_skips_device_read() {
    let tracing = TracingDevice::new(64);
    let dev = as_dyn(&tracing);
    tracing.disk.write_sectors(0, 2, &[0xFF; BLOCK]).unwrap();
    let cache = BufferCache::new(2);

    let guard = cache.acquire(&dev, 0, BLOCK, Intent::Write).unwrap();
    assert!(guard.map(|data| data.iter().all(|&b| b == 0)));
    assert_eq!(BLOCK, guard.len());
    assert!(tracing.ops().is_empty());
}

#[test]
fn concurrent_acquires_read_once() {
    let tracing = TracingDevice::slow(64, Duration::from_millis(50));
    let dev = as_dyn(&tracing);
    let cache = BufferCache::new(4);

    thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                let guard = cache.acquire(&dev, 7, BLOCK, Intent::Read).unwrap();
                assert_eq!(7, guard.block());
            });
        }
    });

    assert_eq!(1, tracing.reads.load(Ordering::SeqCst));
    assert_eq!(1, cache.stats().misses);
}

#[test]
fn load_failure_is_reported_and_slot_recycled() {
    let tracing = TracingDevice::new(64);
    let dev = as_dyn(&tracing);
    let cache = BufferCache::new(1);

    tracing.fail_reads.store(true, Ordering::SeqCst);
    assert_eq!(
        DeviceError::IoFailure,
        cache.acquire(&dev, 1, BLOCK, Intent::Read).unwrap_err()
    );

    // 失败的键不留在缓存中，槽位可以复用
    tracing.fail_reads.store(false, Ordering::SeqCst);
    drop(cache.acquire(&dev, 1, BLOCK, Intent::Read).unwrap());
    assert_eq!(2, tracing.reads.load(Ordering::SeqCst));
}

#[test]
fn waiters_see_load_failure() {
    let tracing = TracingDevice::slow(64, Duration::from_millis(50));
    let dev = as_dyn(&tracing);
    let cache = BufferCache::new(2);
    tracing.fail_reads.store(true, Ordering::SeqCst);

    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                assert_eq!(
                    DeviceError::IoFailure,
                    cache.acquire(&dev, 9, BLOCK, Intent::Read).unwrap_err()
                );
            });
        }
    });

    tracing.fail_reads.store(false, Ordering::SeqCst);
    let a = cache.acquire(&dev, 1, BLOCK, Intent::Read).unwrap();
    let b = cache.acquire(&dev, 2, BLOCK, Intent::Read).unwrap();
    assert_ne!(a.block(), b.block());
}

#[test]
fn acquire_waits_for_release() {
    let tracing = TracingDevice::new(64);
    let dev = as_dyn(&tracing);
    let cache = BufferCache::new(1);
    let done = AtomicBool::new(false);

    let held = cache.acquire(&dev, 1, BLOCK, Intent::Read).unwrap();
    thread::scope(|s| {
        s.spawn(|| {
            drop(cache.acquire(&dev, 2, BLOCK, Intent::Read).unwrap());
            done.store(true, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::SeqCst));
        drop(held);
    });

    assert!(done.load(Ordering::SeqCst));
}

#[test]
fn flush_and_invalidate() {
    let tracing = TracingDevice::new(64);
    let dev = as_dyn(&tracing);
    let cache = BufferCache::new(4);

    for block in 0..3 {
        cache
            .acquire(&dev, block, BLOCK, Intent::Write)
            .unwrap()
            .write_u16(0, block as u16 + 1);
    }
    assert_eq!(3, cache.stats().dirty);

    cache.flush_all(&dev).unwrap();
    assert_eq!(0, cache.stats().dirty);
    assert_eq!(3, cache.stats().writebacks);

    let mut raw = [0; SECTOR];
    tracing.disk.read_sectors(4, 1, &mut raw).unwrap();
    assert_eq!([3, 0], raw[..2]);

    cache.invalidate(&dev).unwrap();
    drop(cache.acquire(&dev, 2, BLOCK, Intent::Read).unwrap());
    assert_eq!(1, tracing.reads.load(Ordering::SeqCst));
}

#[test]
fn devices_are_kept_apart() {
    let first = as_dyn(&TracingDevice::new(8));
    let second = as_dyn(&TracingDevice::new(8));
    let cache = BufferCache::new(4);

    cache
        .acquire(&first, 0, BLOCK, Intent::Write)
        .unwrap()
        .write_u32(0, 1);
    cache
        .acquire(&second, 0, BLOCK, Intent::Write)
        .unwrap()
        .write_u32(0, 2);

    assert_eq!(
        1,
        cache.acquire(&first, 0, BLOCK, Intent::Read).unwrap().read_u32(0)
    );
    cache.sync().unwrap();
    assert_eq!(0, cache.stats().dirty);
}
