//! # 块缓存层
//!
//! 块设备读写速度一般慢于内存读写速度，因此我们在内存中开辟缓冲区，
//! 把即将操作的块复制到内存中，提高对块设备的操作效率。
//!
//! 缓存对使用者来说是透明的：文件系统驱动对块设备的操作都经过 [`BufferCache`]，
//! 且**操作块时一定持有它的 [`BufferGuard`]**。
//! 同一 (设备, 块号) 在任意时刻至多对应一个缓冲区；
//! 只有不再被引用的缓冲区才会被淘汰，脏块淘汰前先写回。
//!
//! 缓存锁只保护簿记，设备读写总在锁外进行。

#![no_std]

extern crate alloc;

mod buffer;

use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use core::{
    fmt,
    hint::spin_loop,
    sync::atomic::{AtomicU64, Ordering},
};

use block_dev::{BlockDevice, DeviceError};
use log::{debug, error, warn};
use spin::Mutex;

use self::buffer::{Buffer, State};

/// 默认的缓冲区个数
pub const DEFAULT_CAPACITY: usize = 64;

/// 获取缓冲区的意图
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// 需要块的现有内容
    Read,
    /// 将整块覆写，未命中时不读设备，直接清零
    Write,
}

/// 设备身份：共享句柄所指对象的地址
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct DeviceId(usize);

impl DeviceId {
    fn of(dev: &Arc<dyn BlockDevice>) -> Self {
        Self(Arc::as_ptr(dev).cast::<()>() as usize)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct BlockKey {
    device: DeviceId,
    block: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub writebacks: u64,
    /// 统计时刻的脏块数
    pub dirty: usize,
}

/// 缓冲区槽位
struct Slot {
    key: Option<BlockKey>,
    /// 持有设备，保证缓存期间设备存活
    device: Option<Arc<dyn BlockDevice>>,
    block_size: usize,
    refs: usize,
    last_used: u64,
    inserted: u64,
    buffer: Arc<Buffer>,
}

impl Slot {
    fn vacant() -> Self {
        Self {
            key: None,
            device: None,
            block_size: 0,
            refs: 0,
            last_used: 0,
            inserted: 0,
            buffer: Arc::new(Buffer::new()),
        }
    }

    fn is_vacant(&self) -> bool {
        self.key.is_none() && self.refs == 0
    }
}

struct Inner {
    slots: Vec<Slot>,
    index: BTreeMap<BlockKey, usize>,
    /// 逻辑时钟，每次使用递增
    clock: u64,
}

impl Inner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn pin(&mut self, slot: usize) -> Arc<Buffer> {
        let now = self.tick();
        let slot = &mut self.slots[slot];
        slot.refs += 1;
        slot.last_used = now;
        Arc::clone(&slot.buffer)
    }

    /// 淘汰策略：空槽优先，否则选最久未用的无引用槽，同时按插入顺序
    fn victim(&self) -> Option<usize> {
        if let Some(slot) = self.slots.iter().position(Slot::is_vacant) {
            return Some(slot);
        }

        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.refs == 0)
            .min_by_key(|(_, slot)| (slot.last_used, slot.inserted))
            .map(|(index, _)| index)
    }
}

/// 由引用计数管理的块缓冲区缓存
pub struct BufferCache {
    capacity: usize,
    inner: Mutex<Inner>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    writebacks: AtomicU64,
}

impl BufferCache {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "buffer cache needs at least one slot");

        Self {
            capacity,
            inner: Mutex::new(Inner {
                slots: (0..capacity).map(|_| Slot::vacant()).collect(),
                index: BTreeMap::new(),
                clock: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            writebacks: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 获取设备 `dev` 上大小为 `block_size` 的第 `block` 块。
    ///
    /// 没有可淘汰的缓冲区时自旋等待，直到有引用被释放。
    pub fn acquire(
        &self,
        dev: &Arc<dyn BlockDevice>,
        block: u64,
        block_size: usize,
        intent: Intent,
    ) -> Result<BufferGuard<'_>, DeviceError> {
        let sector_size = dev.sector_size();
        if block_size == 0 || block_size % sector_size != 0 {
            return Err(DeviceError::InvalidArgument);
        }
        let key = BlockKey {
            device: DeviceId::of(dev),
            block,
        };

        loop {
            let mut inner = self.inner.lock();

            if let Some(&slot) = inner.index.get(&key) {
                if inner.slots[slot].block_size != block_size {
                    return Err(DeviceError::InvalidArgument);
                }
                self.hits.fetch_add(1, Ordering::Relaxed);
                let buffer = inner.pin(slot);
                drop(inner);
                return self.attach(slot, block, buffer);
            }

            let Some(victim) = inner.victim() else {
                drop(inner);
                spin_loop();
                continue;
            };

            if inner.slots[victim].buffer.is_dirty() {
                let slot = &inner.slots[victim];
                if let (Some(old_dev), Some(old_key)) = (slot.device.clone(), slot.key) {
                    // 先写回，再重新挑选
                    let old_size = slot.block_size;
                    let buffer = inner.pin(victim);
                    drop(inner);

                    let result = self.write_back(&buffer, &old_dev, old_key.block, old_size);
                    self.release(victim);
                    result?;
                    continue;
                }
                // 无主的脏块
                slot.buffer.clear_dirty();
            }

            let now = inner.tick();
            let slot = &mut inner.slots[victim];
            let old = slot.key.replace(key);
            slot.device = Some(Arc::clone(dev));
            slot.block_size = block_size;
            slot.refs = 1;
            slot.last_used = now;
            slot.inserted = now;
            let buffer = Arc::clone(&slot.buffer);
            buffer.set_state(State::Loading);
            if let Some(old) = old {
                inner.index.remove(&old);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
            inner.index.insert(key, victim);
            self.misses.fetch_add(1, Ordering::Relaxed);
            drop(inner);

            return self.fill(victim, key, dev, block_size, intent, buffer);
        }
    }

    /// 将设备 `dev` 的全部脏块写回
    pub fn flush_all(&self, dev: &Arc<dyn BlockDevice>) -> Result<(), DeviceError> {
        let id = DeviceId::of(dev);
        self.flush_where(|key| key.device == id)?;
        dev.flush()
    }

    /// 将所有设备的脏块写回
    pub fn sync(&self) -> Result<(), DeviceError> {
        self.flush_where(|_| true)
    }

    /// 写回并丢弃设备 `dev` 的所有无引用缓冲区，卸载时使用
    pub fn invalidate(&self, dev: &Arc<dyn BlockDevice>) -> Result<(), DeviceError> {
        self.flush_all(dev)?;

        let id = DeviceId::of(dev);
        let mut inner = self.inner.lock();
        let Inner { slots, index, .. } = &mut *inner;
        for (pos, slot) in slots.iter_mut().enumerate() {
            let Some(key) = slot.key.filter(|key| key.device == id) else {
                continue;
            };
            if slot.refs != 0 {
                warn!("block {} still referenced, kept in cache", key.block);
                continue;
            }
            index.remove(&key);
            slot.key = None;
            slot.device = None;
            slot.buffer.set_state(State::Vacant);
            debug!("slot {pos} dropped block {}", key.block);
        }

        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        let dirty = self
            .inner
            .lock()
            .slots
            .iter()
            .filter(|slot| slot.key.is_some() && slot.buffer.is_dirty())
            .count();

        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            writebacks: self.writebacks.load(Ordering::Relaxed),
            dirty,
        }
    }
}

impl BufferCache {
    /// 挂靠到已存在的缓冲区，等待其加载完毕
    fn attach(
        &self,
        slot: usize,
        block: u64,
        buffer: Arc<Buffer>,
    ) -> Result<BufferGuard<'_>, DeviceError> {
        loop {
            match buffer.state() {
                State::Ready => {
                    return Ok(BufferGuard {
                        cache: self,
                        slot,
                        block,
                        buffer,
                    });
                }
                State::Failed(err) => {
                    self.release(slot);
                    return Err(err);
                }
                _ => spin_loop(),
            }
        }
    }

    fn fill(
        &self,
        slot: usize,
        key: BlockKey,
        dev: &Arc<dyn BlockDevice>,
        block_size: usize,
        intent: Intent,
        buffer: Arc<Buffer>,
    ) -> Result<BufferGuard<'_>, DeviceError> {
        let block = key.block;
        let result = {
            let mut data = buffer.data.write();
            data.clear();
            data.resize(block_size, 0);
            match intent {
                Intent::Write => Ok(()),
                Intent::Read => {
                    let count = block_size / dev.sector_size();
                    dev.read_sectors(block * count as u64, count, &mut data)
                }
            }
        };

        match result {
            Ok(()) => {
                buffer.clear_dirty();
                buffer.set_state(State::Ready);
                debug!("block {block} loaded into slot {slot}");
                Ok(BufferGuard {
                    cache: self,
                    slot,
                    block,
                    buffer,
                })
            }
            Err(err) => {
                error!("failed to load block {block}: {err}");
                let mut inner = self.inner.lock();
                inner.index.remove(&key);
                let slot = &mut inner.slots[slot];
                slot.key = None;
                slot.device = None;
                slot.refs -= 1;
                // 等待者看到失败后各自释放引用，归零时槽位重新可用
                buffer.set_state(State::Failed(err));
                Err(err)
            }
        }
    }

    fn write_back(
        &self,
        buffer: &Buffer,
        dev: &Arc<dyn BlockDevice>,
        block: u64,
        block_size: usize,
    ) -> Result<(), DeviceError> {
        let data = buffer.data.read();
        if !buffer.take_dirty() {
            return Ok(());
        }

        let count = block_size / dev.sector_size();
        match dev.write_sectors(block * count as u64, count, &data) {
            Ok(()) => {
                self.writebacks.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                error!("failed to write back block {block}: {err}");
                buffer.mark_dirty();
                Err(err)
            }
        }
    }

    /// 写回满足条件的脏块。遇到失败仍继续，最后报告首个错误。
    fn flush_where(&self, pred: impl Fn(&BlockKey) -> bool) -> Result<(), DeviceError> {
        let pinned: Vec<_> = {
            let mut inner = self.inner.lock();
            let targets: Vec<_> = inner
                .slots
                .iter()
                .enumerate()
                .filter(|(_, slot)| {
                    slot.key.as_ref().is_some_and(&pred)
                        && slot.buffer.state() == State::Ready
                        && slot.buffer.is_dirty()
                })
                .map(|(index, _)| index)
                .collect();
            targets
                .into_iter()
                .filter_map(|index| {
                    let slot = &inner.slots[index];
                    let dev = Arc::clone(slot.device.as_ref()?);
                    let (block, block_size) = (slot.key?.block, slot.block_size);
                    Some((index, inner.pin(index), dev, block, block_size))
                })
                .collect()
        };

        let mut result = Ok(());
        for (index, buffer, dev, block, block_size) in pinned {
            if let Err(err) = self.write_back(&buffer, &dev, block, block_size) {
                result = result.and(Err(err));
            }
            self.release(index);
        }

        result
    }

    fn release(&self, slot: usize) {
        let mut inner = self.inner.lock();
        let slot = &mut inner.slots[slot];
        slot.refs -= 1;
        if slot.key.is_none() && slot.refs == 0 {
            slot.buffer.set_state(State::Vacant);
        }
    }
}

impl fmt::Debug for BufferCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferCache")
            .field("capacity", &self.capacity)
            .field("stats", &self.stats())
            .finish()
    }
}

/// 缓冲区的引用，析构时归还
pub struct BufferGuard<'a> {
    cache: &'a BufferCache,
    slot: usize,
    block: u64,
    buffer: Arc<Buffer>,
}

impl BufferGuard<'_> {
    pub fn block(&self) -> u64 {
        self.block
    }

    pub fn len(&self) -> usize {
        self.buffer.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_dirty(&self) -> bool {
        self.buffer.is_dirty()
    }

    pub fn mark_dirty(&self) {
        self.buffer.mark_dirty();
    }

    #[inline]
    pub fn map<V>(&self, f: impl FnOnce(&[u8]) -> V) -> V {
        f(&self.buffer.data.read())
    }

    /// 修改块内容，并标记为脏块
    #[inline]
    pub fn map_mut<V>(&self, f: impl FnOnce(&mut [u8]) -> V) -> V {
        let value = f(&mut self.buffer.data.write());
        self.buffer.mark_dirty();
        value
    }

    pub fn read_u16(&self, offset: usize) -> u16 {
        self.map(|data| u16::from_le_bytes([data[offset], data[offset + 1]]))
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        self.map(|data| {
            let mut bytes = [0; 4];
            bytes.copy_from_slice(&data[offset..offset + 4]);
            u32::from_le_bytes(bytes)
        })
    }

    pub fn write_u16(&self, offset: usize, value: u16) {
        self.map_mut(|data| data[offset..offset + 2].copy_from_slice(&value.to_le_bytes()));
    }

    pub fn write_u32(&self, offset: usize, value: u32) {
        self.map_mut(|data| data[offset..offset + 4].copy_from_slice(&value.to_le_bytes()));
    }
}

impl Drop for BufferGuard<'_> {
    fn drop(&mut self) {
        self.cache.release(self.slot);
    }
}

impl fmt::Debug for BufferGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferGuard")
            .field("slot", &self.slot)
            .field("block", &self.block)
            .field("dirty", &self.is_dirty())
            .finish()
    }
}
