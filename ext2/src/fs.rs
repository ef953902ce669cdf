//! 接入虚拟文件系统层

use alloc::sync::Arc;
use core::{any::Any, fmt};

use block_cache::{BufferCache, Intent};
use block_dev::BlockDevice;
use log::{error, info};
use spin::RwLock;
use vfs::{
    Clock, DirEntry, Error, FileSystem, FsStat, Inode, InodeKind, MountError, NAME_MAX, Result,
    Stat, check_name,
};

use crate::{
    FS_NAME, ROOT_INO, dir,
    layout::{DirRecord, DiskInode, FileType, Mode},
    volume::Volume,
};

/// ext2 文件系统实例，挂载前不可用
pub struct Ext2FileSystem {
    cache: Arc<BufferCache>,
    clock: Arc<dyn Clock>,
    volume: RwLock<Option<Arc<Volume>>>,
}

impl Ext2FileSystem {
    pub fn new(cache: Arc<BufferCache>, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache,
            clock,
            volume: RwLock::new(None),
        }
    }

    fn volume(&self) -> Result<Arc<Volume>> {
        self.volume.read().clone().ok_or(Error::NotFound)
    }
}

impl FileSystem for Ext2FileSystem {
    fn name(&self) -> &'static str {
        FS_NAME
    }

    fn mount(&self, source: Option<Arc<dyn BlockDevice>>) -> Result<()> {
        let dev = source.ok_or(Error::Mount(MountError::NoDevice))?;
        let mut state = self.volume.write();
        if state.is_some() {
            return Err(Error::Busy);
        }

        let vol = Volume::open(dev, Arc::clone(&self.cache), Arc::clone(&self.clock))?;
        if !vol.read_inode(ROOT_INO)?.is_dir() {
            error!("root inode is not a directory");
            return Err(Error::CorruptFilesystem);
        }
        let now = vol.now();
        vol.update_super(|sb| {
            sb.mnt_count = sb.mnt_count.wrapping_add(1);
            sb.mtime = now;
        })?;

        *state = Some(Arc::new(vol));
        info!("ext2 mounted");
        Ok(())
    }

    fn unmount(&self) -> Result<()> {
        let vol = self.volume.write().take().ok_or(Error::NotFound)?;
        {
            let _guard = vol.lock.write();
            vol.reap_orphans()?;
        }
        vol.flush()?;
        info!("ext2 unmounted");
        Ok(())
    }

    fn root(&self) -> Result<Arc<dyn Inode>> {
        let vol = self.volume()?;
        Ok(Ext2Inode::open(&vol, ROOT_INO, InodeKind::Directory))
    }

    fn stat_fs(&self) -> Result<FsStat> {
        let sb = self.volume()?.super_block();
        Ok(FsStat {
            block_size: sb.block_size() as u64,
            total_blocks: sb.blocks_count.into(),
            free_blocks: sb.free_blocks_count.into(),
            total_inodes: sb.inodes_count.into(),
            free_inodes: sb.free_inodes_count.into(),
            max_name_len: NAME_MAX,
        })
    }

    fn sync(&self) -> Result<()> {
        let vol = self.volume()?;
        let _guard = vol.lock.read();
        vol.flush()
    }
}

/// 指向一个 inode 的句柄。
/// 句柄存活期间，即使链接数归零，inode 及其数据块也不会被释放。
pub struct Ext2Inode {
    vol: Arc<Volume>,
    ino: u32,
    kind: InodeKind,
}

impl Ext2Inode {
    /// 调用者可以持有 [`Volume::lock`]
    fn open(vol: &Arc<Volume>, ino: u32, kind: InodeKind) -> Arc<Self> {
        vol.retain(ino);
        Arc::new(Self {
            vol: Arc::clone(vol),
            ino,
            kind,
        })
    }

    pub fn ino(&self) -> u32 {
        self.ino
    }

    /// 新的块与 inode 优先从本 inode 所在的组分配
    fn goal(&self) -> u32 {
        self.vol.group_of_inode(self.ino)
    }

    fn ensure_dir(&self) -> Result<()> {
        if self.kind.is_dir() {
            Ok(())
        } else {
            Err(Error::NotADirectory)
        }
    }

    /// 读出本目录的 inode，已被删除的目录视作不存在
    fn live_dir(&self) -> Result<DiskInode> {
        let dir = self.vol.read_inode(self.ino)?;
        if dir.links_count == 0 {
            return Err(Error::NotFound);
        }
        Ok(dir)
    }

    /// 目录项中没有文件类型时读 inode 得到
    fn entry_kind(&self, ino: u32, file_type: u8) -> Result<InodeKind> {
        match FileType::kind(file_type) {
            Some(kind) if self.vol.has_filetype() => Ok(kind),
            _ => self.vol.read_inode(ino)?.kind(),
        }
    }

    fn new_child(&self, name: &str, mode: Mode, permissions: u16) -> Result<Arc<dyn Inode>> {
        check_name(name)?;
        self.ensure_dir()?;
        let vol = &self.vol;
        let _guard = vol.lock.write();

        let mut parent = self.live_dir()?;
        if dir::find_entry(vol, &parent, name)?.is_some() {
            return Err(Error::Exists);
        }

        let is_dir = mode == Mode::Directory;
        let goal = self.goal();
        let ino = vol.alloc_inode(goal, is_dir)?;
        let now = vol.now();
        let mut child = DiskInode::new(mode, permissions, if is_dir { 2 } else { 1 }, now);

        let added = self.init_child(&mut child, ino, goal).and_then(|()| {
            let added = dir::add_entry(vol, &mut parent, goal, name, ino, FileType::from_kind(mode.kind()));
            if added.is_ok() {
                // 子目录的 `..`
                if is_dir {
                    parent.links_count += 1;
                }
                parent.touch(now);
            }
            vol.write_inode(self.ino, &parent).and(added)
        });
        if let Err(err) = added {
            // 撤销已分配的 inode 与数据块
            let undo = child
                .clear_from(vol, 0)
                .and_then(|()| vol.free_inode(ino, is_dir));
            if let Err(undo) = undo {
                error!("failed to roll back inode {ino}: {undo}");
            }
            return Err(err);
        }

        Ok(Ext2Inode::open(vol, ino, mode.kind()))
    }

    /// 目录写入 `.` 与 `..`，然后落盘新 inode
    fn init_child(&self, child: &mut DiskInode, ino: u32, goal: u32) -> Result<()> {
        let vol = &self.vol;
        if child.is_dir() {
            let block_size = vol.block_size();
            let block = child.alloc_block_id(vol, 0, goal)?;
            child.set_size(block_size as u64);

            let dot = DirRecord::new(ino, 12, ".", FileType::Directory);
            let dotdot = DirRecord::new(self.ino, block_size - 12, "..", FileType::Directory);
            vol.acquire(block.into(), Intent::Read)?.map_mut(|data| {
                dot.write(data, 0, ".")?;
                dotdot.write(data, 12, "..")
            })?;
        }
        vol.write_inode(ino, child)
    }

    /// 链接数归零后释放，仍有句柄时推迟
    fn drop_link(&self, ino: u32) -> Result<()> {
        if self.vol.defer_if_open(ino) {
            return Ok(());
        }
        self.vol.destroy(ino)
    }
}

impl Inode for Ext2Inode {
    fn kind(&self) -> InodeKind {
        self.kind
    }

    fn stat(&self) -> Result<Stat> {
        let _guard = self.vol.lock.read();
        let inode = self.vol.read_inode(self.ino)?;

        Ok(Stat {
            ino: self.ino.into(),
            kind: self.kind,
            mode: inode.permissions(),
            size: inode.size(),
            links: inode.links_count.into(),
            blocks: inode.blocks.into(),
            block_size: self.vol.block_size() as u64,
            atime: inode.atime.into(),
            mtime: inode.mtime.into(),
            ctime: inode.ctime.into(),
        })
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if self.kind.is_dir() {
            return Err(Error::IsADirectory);
        }
        let _guard = self.vol.lock.read();
        self.vol.read_inode(self.ino)?.read_at(&self.vol, offset, buf)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        match self.kind {
            InodeKind::Regular => {}
            InodeKind::Directory => return Err(Error::IsADirectory),
            _ => return Err(Error::InvalidArgument),
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let vol = &self.vol;
        let _guard = vol.lock.write();
        let mut inode = vol.read_inode(self.ino)?;
        let written = inode.write_at(vol, self.goal(), offset, buf);
        if matches!(written, Ok(n) if n > 0) {
            inode.touch(vol.now());
        }
        // 分配失败前已挂上的间接块也要落盘
        vol.write_inode(self.ino, &inode)?;
        written
    }

    fn truncate(&self, size: u64) -> Result<()> {
        match self.kind {
            InodeKind::Regular => {}
            InodeKind::Directory => return Err(Error::IsADirectory),
            _ => return Err(Error::InvalidArgument),
        }
        if size > u64::from(u32::MAX) {
            return Err(Error::NoSpace);
        }

        let vol = &self.vol;
        let _guard = vol.lock.write();
        let mut inode = vol.read_inode(self.ino)?;
        let block_size = vol.block_size() as u64;

        if size < inode.size() {
            let cleared = inode.clear_from(vol, size.div_ceil(block_size));
            if cleared.is_err() {
                vol.write_inode(self.ino, &inode)?;
                return cleared;
            }
            // 末块中越过新大小的部分清零，之后扩大时读出全零
            let tail = (size % block_size) as usize;
            if tail != 0 {
                let block = inode.block_id(vol, size / block_size)?;
                if block != 0 {
                    vol.acquire(block.into(), Intent::Read)?
                        .map_mut(|data| data[tail..].fill(0));
                }
            }
        }

        inode.set_size(size);
        inode.touch(vol.now());
        vol.write_inode(self.ino, &inode)
    }

    fn lookup(&self, name: &str) -> Result<Arc<dyn Inode>> {
        self.ensure_dir()?;
        let _guard = self.vol.lock.read();
        let dir = self.vol.read_inode(self.ino)?;

        let (ino, file_type) = dir::find_entry(&self.vol, &dir, name)?.ok_or(Error::NotFound)?;
        let kind = self.entry_kind(ino, file_type)?;
        Ok(Ext2Inode::open(&self.vol, ino, kind))
    }

    fn create(&self, name: &str, mode: u16) -> Result<Arc<dyn Inode>> {
        self.new_child(name, Mode::Regular, mode)
    }

    fn mkdir(&self, name: &str, mode: u16) -> Result<Arc<dyn Inode>> {
        self.new_child(name, Mode::Directory, mode)
    }

    fn unlink(&self, name: &str) -> Result<()> {
        check_name(name)?;
        self.ensure_dir()?;
        let vol = &self.vol;
        let _guard = vol.lock.write();

        let mut parent = self.live_dir()?;
        let (ino, _) = dir::find_entry(vol, &parent, name)?.ok_or(Error::NotFound)?;
        let mut child = vol.read_inode(ino)?;
        if child.is_dir() {
            return Err(Error::IsADirectory);
        }

        let now = vol.now();
        dir::remove_entry(vol, &parent, name)?;
        parent.touch(now);
        vol.write_inode(self.ino, &parent)?;

        child.links_count = child.links_count.saturating_sub(1);
        child.ctime = now;
        vol.write_inode(ino, &child)?;
        if child.links_count == 0 {
            self.drop_link(ino)?;
        }
        Ok(())
    }

    fn rmdir(&self, name: &str) -> Result<()> {
        check_name(name)?;
        self.ensure_dir()?;
        let vol = &self.vol;
        let _guard = vol.lock.write();

        let mut parent = self.live_dir()?;
        let (ino, _) = dir::find_entry(vol, &parent, name)?.ok_or(Error::NotFound)?;
        let mut child = vol.read_inode(ino)?;
        if !child.is_dir() {
            return Err(Error::NotADirectory);
        }
        if !dir::is_empty(vol, &child)? {
            return Err(Error::NotEmpty);
        }

        let now = vol.now();
        dir::remove_entry(vol, &parent, name)?;
        parent.links_count = parent.links_count.saturating_sub(1);
        parent.touch(now);
        vol.write_inode(self.ino, &parent)?;

        child.links_count = 0;
        child.ctime = now;
        vol.write_inode(ino, &child)?;
        self.drop_link(ino)
    }

    fn link(&self, name: &str, target: &Arc<dyn Inode>) -> Result<()> {
        check_name(name)?;
        self.ensure_dir()?;
        let target = target
            .as_any()
            .downcast_ref::<Ext2Inode>()
            .filter(|target| Arc::ptr_eq(&target.vol, &self.vol))
            .ok_or(Error::InvalidArgument)?;
        if target.kind.is_dir() {
            return Err(Error::IsADirectory);
        }

        let vol = &self.vol;
        let _guard = vol.lock.write();
        let mut parent = self.live_dir()?;
        if dir::find_entry(vol, &parent, name)?.is_some() {
            return Err(Error::Exists);
        }
        let mut inode = vol.read_inode(target.ino)?;
        if inode.links_count == 0 {
            return Err(Error::NotFound);
        }
        if inode.links_count == u16::MAX {
            return Err(Error::InvalidArgument);
        }

        let now = vol.now();
        let added = dir::add_entry(
            vol,
            &mut parent,
            self.goal(),
            name,
            target.ino,
            FileType::from_kind(target.kind),
        );
        if added.is_ok() {
            parent.touch(now);
        }
        vol.write_inode(self.ino, &parent)?;
        added?;

        inode.links_count += 1;
        inode.ctime = now;
        vol.write_inode(target.ino, &inode)
    }

    fn read_dir_at(&self, cursor: usize) -> Result<Option<(DirEntry, usize)>> {
        self.ensure_dir()?;
        let _guard = self.vol.lock.read();
        let dir = self.vol.read_inode(self.ino)?;

        let Some((raw, next)) = dir::entry_at(&self.vol, &dir, cursor)? else {
            return Ok(None);
        };
        let entry = DirEntry {
            ino: raw.ino.into(),
            kind: self.entry_kind(raw.ino, raw.file_type)?,
            name: raw.name,
        };
        Ok(Some((entry, next)))
    }

    fn sync(&self) -> Result<()> {
        let _guard = self.vol.lock.read();
        self.vol.flush()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for Ext2Inode {
    fn drop(&mut self) {
        if let Err(err) = self.vol.release(self.ino) {
            error!("failed to free inode {}: {err}", self.ino);
        }
    }
}

impl fmt::Debug for Ext2Inode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ext2Inode")
            .field("ino", &self.ino)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}
