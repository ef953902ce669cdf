//! # 挂载表与路径分派
//!
//! 挂载表把规范化的挂载点映射到文件系统实例，
//! 路径解析按分量边界取最长的挂载点前缀，再从该文件系统的根逐级查找。

use alloc::{
    borrow::ToOwned,
    boxed::Box,
    collections::BTreeMap,
    string::String,
    sync::Arc,
    vec::Vec,
};
use core::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};

use block_cache::BufferCache;
use block_dev::BlockDevice;
use log::{debug, info, warn};
use spin::RwLock;

use crate::{
    DEFAULT_DIR_MODE, DEFAULT_FILE_MODE, Error, File, FileSystem, FsStat, Inode, InodeKind,
    MountError, OpenFlag, OpenFlags, PathError, ReadDir, Registry, Result, Stat,
    path::{components, is_prefix, normalize, split_parent},
};

pub type VfsResult<T> = core::result::Result<T, PathError>;

type MountTable = BTreeMap<String, Arc<Mount>>;

/// 为错误附上路径
trait WithPath<T> {
    fn at(self, path: &str) -> VfsResult<T>;
}

impl<T> WithPath<T> for Result<T> {
    fn at(self, path: &str) -> VfsResult<T> {
        self.map_err(|error| PathError::new(path, error))
    }
}

/// 挂载表中的一项
pub struct Mount {
    point: String,
    fs_type: String,
    fs: Box<dyn FileSystem>,
    source: Option<Arc<dyn BlockDevice>>,
    root: Arc<dyn Inode>,
    /// 此挂载下打开的文件与目录数
    open: AtomicUsize,
}

impl Mount {
    pub fn point(&self) -> &str {
        &self.point
    }

    pub fn fs_type(&self) -> &str {
        &self.fs_type
    }

    pub fn fs(&self) -> &dyn FileSystem {
        self.fs.as_ref()
    }

    pub fn open_count(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Mount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mount")
            .field("point", &self.point)
            .field("fs_type", &self.fs_type)
            .field("open", &self.open_count())
            .finish_non_exhaustive()
    }
}

/// 挂载点上的一个打开引用，析构时归还
pub(crate) struct OpenRef(Arc<Mount>);

impl OpenRef {
    fn new(mount: &Arc<Mount>) -> Self {
        mount.open.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(mount))
    }
}

impl Clone for OpenRef {
    fn clone(&self) -> Self {
        Self::new(&self.0)
    }
}

impl Drop for OpenRef {
    fn drop(&mut self) {
        self.0.open.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub point: String,
    pub fs_type: String,
    pub has_source: bool,
    pub open: usize,
}

/// 虚拟文件系统：注册表、挂载表与可选的共享缓冲区缓存
pub struct Vfs {
    registry: Registry,
    cache: Option<Arc<BufferCache>>,
    mounts: RwLock<MountTable>,
}

impl Vfs {
    pub fn new(registry: Registry, cache: Option<Arc<BufferCache>>) -> Self {
        Self {
            registry,
            cache,
            mounts: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn cache(&self) -> Option<&Arc<BufferCache>> {
        self.cache.as_ref()
    }

    /// 把 `fs_type` 类型的新实例挂载到 `point`
    pub fn mount(
        &self,
        point: &str,
        fs_type: &str,
        source: Option<Arc<dyn BlockDevice>>,
    ) -> VfsResult<()> {
        let point = normalize(point);
        let table = self.mounts.upgradeable_read();

        if table.contains_key(&point) {
            return Err(PathError::new(point, Error::Busy));
        }
        if point != "/" {
            let (_, dir) = resolve_in(&table, &point).at(&point)?;
            if !dir.kind().is_dir() {
                return Err(PathError::new(point, Error::NotADirectory));
            }
        }

        let fs = self.registry.create(fs_type).at(&point)?;
        fs.mount(source.clone())
            .map_err(|err| match err {
                Error::CorruptFilesystem => Error::Mount(MountError::InvalidSuperblock),
                Error::Device(err) => Error::Mount(MountError::Device(err)),
                err => err,
            })
            .at(&point)?;
        let root = match fs.root() {
            Ok(root) => root,
            Err(err) => {
                if let Err(undo) = fs.unmount() {
                    warn!("{point}: rollback after failed mount: {undo}");
                }
                return Err(PathError::new(point, err));
            }
        };

        let mount = Arc::new(Mount {
            point: point.clone(),
            fs_type: fs_type.to_owned(),
            fs,
            source,
            root,
            open: AtomicUsize::new(0),
        });
        table.upgrade().insert(point.clone(), mount);
        info!("{fs_type} mounted at {point}");

        Ok(())
    }

    /// 卸载 `point`。挂载下仍有打开的句柄或嵌套的挂载时返回 [`Error::Busy`]。
    pub fn unmount(&self, point: &str) -> VfsResult<()> {
        let point = normalize(point);
        let mut table = self.mounts.write();

        let mount = table
            .get(&point)
            .cloned()
            .ok_or(Error::NotFound)
            .at(&point)?;
        if mount.open_count() != 0 {
            debug!("{point}: {} handles still open", mount.open_count());
            return Err(PathError::new(point, Error::Busy));
        }
        if table
            .keys()
            .any(|other| *other != point && is_prefix(&point, other))
        {
            return Err(PathError::new(point, Error::Busy));
        }

        mount.fs.unmount().at(&point)?;
        // 驱动已卸载，无论写回是否成功都要摘掉表项
        table.remove(&point);
        info!("{point} unmounted");

        if let (Some(cache), Some(source)) = (&self.cache, &mount.source) {
            if let Err(err) = cache.invalidate(source) {
                warn!("{point}: write-back after unmount failed: {err}");
                return Err(PathError::new(point, err.into()));
            }
        }

        Ok(())
    }

    pub fn mounts(&self) -> Vec<MountInfo> {
        self.mounts
            .read()
            .values()
            .map(|mount| MountInfo {
                point: mount.point.clone(),
                fs_type: mount.fs_type.clone(),
                has_source: mount.source.is_some(),
                open: mount.open_count(),
            })
            .collect()
    }

    /// 解析路径得到节点。返回的节点不计入打开引用。
    pub fn resolve(&self, path: &str) -> VfsResult<Arc<dyn Inode>> {
        let path = normalize(path);
        let table = self.mounts.read();
        resolve_in(&table, &path).map(|(_, inode)| inode).at(&path)
    }

    pub fn stat(&self, path: &str) -> VfsResult<Stat> {
        let path = normalize(path);
        let table = self.mounts.read();
        resolve_in(&table, &path)
            .and_then(|(_, inode)| inode.stat())
            .at(&path)
    }

    /// 路径所在文件系统的统计信息
    pub fn stat_fs(&self, path: &str) -> VfsResult<FsStat> {
        let path = normalize(path);
        let table = self.mounts.read();
        find_mount(&table, &path)
            .and_then(|mount| mount.fs.stat_fs())
            .at(&path)
    }

    pub fn open(&self, path: &str, flags: OpenFlags) -> VfsResult<File> {
        let path = normalize(path);
        let table = self.mounts.read();

        let (mount, inode) = match resolve_in(&table, &path) {
            Ok(found) => found,
            Err(Error::NotFound) if flags.contains(OpenFlag::Create) => {
                create_in(&table, &path).at(&path)?
            }
            Err(err) => return Err(PathError::new(path, err)),
        };
        // 先占住挂载点再放开挂载表，截断期间不能被卸载
        let open = OpenRef::new(&mount);
        drop(table);

        // 符号链接不跟随
        if inode.kind() == InodeKind::SymLink {
            return Err(PathError::new(path, Error::InvalidArgument));
        }
        let writable = flags.contains(OpenFlag::Write);
        if inode.kind().is_dir() && writable {
            return Err(PathError::new(path, Error::IsADirectory));
        }
        if writable && flags.contains(OpenFlag::Truncate) {
            inode.truncate(0).at(&path)?;
        }

        debug!("{path} opened with {flags:?}");
        Ok(File::new(path, inode, flags, open))
    }

    pub fn create(&self, path: &str) -> VfsResult<()> {
        self.in_parent(path, Error::Exists, |dir, name| {
            dir.create(name, DEFAULT_FILE_MODE).map(drop)
        })
    }

    pub fn mkdir(&self, path: &str) -> VfsResult<()> {
        self.in_parent(path, Error::Exists, |dir, name| {
            dir.mkdir(name, DEFAULT_DIR_MODE).map(drop)
        })
    }

    pub fn unlink(&self, path: &str) -> VfsResult<()> {
        self.in_parent(path, Error::Busy, |dir, name| dir.unlink(name))
    }

    pub fn rmdir(&self, path: &str) -> VfsResult<()> {
        self.in_parent(path, Error::Busy, |dir, name| dir.rmdir(name))
    }

    /// 为 `existing` 建立名为 `new` 的硬链接，二者须在同一挂载下
    pub fn link(&self, existing: &str, new: &str) -> VfsResult<()> {
        let existing = normalize(existing);
        let new = normalize(new);
        let table = self.mounts.read();

        let (src_mount, target) = resolve_in(&table, &existing).at(&existing)?;
        if table.contains_key(&new) {
            return Err(PathError::new(new, Error::Exists));
        }
        let (parent, name) = split_parent(&new)
            .ok_or(Error::Exists)
            .at(&new)?;
        let (dst_mount, dir) = resolve_in(&table, parent).at(&new)?;
        if !Arc::ptr_eq(&src_mount, &dst_mount) {
            return Err(PathError::new(new, Error::InvalidArgument));
        }

        dir.link(name, &target).at(&new)
    }

    /// 把 `old` 移到 `new`，二者须在同一挂载下。挂载点及其上级不能移动。
    pub fn rename(&self, old: &str, new: &str) -> VfsResult<()> {
        let old = normalize(old);
        let new = normalize(new);
        let table = self.mounts.read();

        if table.keys().any(|point| is_prefix(&old, point)) {
            return Err(PathError::new(old, Error::Busy));
        }
        if table.contains_key(&new) {
            return Err(PathError::new(new, Error::Busy));
        }
        if old != new && is_prefix(&old, &new) {
            return Err(PathError::new(new, Error::InvalidArgument));
        }
        let (old_parent, old_name) = split_parent(&old).ok_or(Error::Busy).at(&old)?;
        let (new_parent, new_name) = split_parent(&new).ok_or(Error::Busy).at(&new)?;

        let (src_mount, src_dir) = resolve_in(&table, old_parent).at(&old)?;
        let (dst_mount, dst_dir) = resolve_in(&table, new_parent).at(&new)?;
        if !Arc::ptr_eq(&src_mount, &dst_mount) {
            return Err(PathError::new(new, Error::InvalidArgument));
        }
        if !dst_dir.kind().is_dir() {
            return Err(PathError::new(new, Error::NotADirectory));
        }

        src_dir.rename(old_name, &dst_dir, new_name).at(&old)
    }

    /// 在 `path` 处建立指向 `target` 的符号链接
    pub fn symlink(&self, target: &str, path: &str) -> VfsResult<()> {
        self.in_parent(path, Error::Exists, |dir, name| {
            dir.symlink(name, target).map(drop)
        })
    }

    pub fn read_link(&self, path: &str) -> VfsResult<String> {
        let path = normalize(path);
        let table = self.mounts.read();
        resolve_in(&table, &path)
            .and_then(|(_, inode)| inode.read_link())
            .at(&path)
    }

    pub fn read_dir(&self, path: &str) -> VfsResult<ReadDir> {
        let path = normalize(path);
        let table = self.mounts.read();
        let (mount, dir) = resolve_in(&table, &path).at(&path)?;
        if !dir.kind().is_dir() {
            return Err(PathError::new(path, Error::NotADirectory));
        }

        Ok(ReadDir::pinned(dir, OpenRef::new(&mount)))
    }

    /// 同步每个挂载，再写回缓存中的所有脏块。出错时仍继续，返回首个错误。
    pub fn sync(&self) -> VfsResult<()> {
        let table = self.mounts.read();
        let mut result = Ok(());
        for (point, mount) in table.iter() {
            if let Err(err) = mount.fs.sync() {
                warn!("{point}: sync failed: {err}");
                result = result.and(Err(PathError::new(point.as_str(), err)));
            }
        }
        if let Some(cache) = &self.cache {
            if let Err(err) = cache.sync() {
                result = result.and(Err(PathError::new("/", err.into())));
            }
        }

        result
    }

    /// 在 `path` 的父目录中执行 `op`；`path` 本身是挂载点或根时返回 `on_mount_point`
    fn in_parent<T>(
        &self,
        path: &str,
        on_mount_point: Error,
        op: impl FnOnce(&Arc<dyn Inode>, &str) -> Result<T>,
    ) -> VfsResult<T> {
        let path = normalize(path);
        let table = self.mounts.read();
        if table.contains_key(&path) {
            return Err(PathError::new(path, on_mount_point));
        }
        let Some((parent, name)) = split_parent(&path) else {
            return Err(PathError::new(path, on_mount_point));
        };

        let (_, dir) = resolve_in(&table, parent).at(&path)?;
        if !dir.kind().is_dir() {
            return Err(PathError::new(path, Error::NotADirectory));
        }
        op(&dir, name).at(&path)
    }
}

impl fmt::Debug for Vfs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vfs")
            .field("registry", &self.registry)
            .field("mounts", &*self.mounts.read())
            .finish_non_exhaustive()
    }
}

/// 按分量边界取最长的挂载点前缀
fn find_mount(table: &MountTable, path: &str) -> Result<Arc<Mount>> {
    table
        .iter()
        .filter(|(point, _)| is_prefix(point, path))
        .max_by_key(|(point, _)| point.len())
        .map(|(_, mount)| Arc::clone(mount))
        .ok_or(Error::NotFound)
}

fn resolve_in(table: &MountTable, path: &str) -> Result<(Arc<Mount>, Arc<dyn Inode>)> {
    let mount = find_mount(table, path)?;
    let mut node = Arc::clone(&mount.root);
    for name in components(&mount.point, path) {
        if !node.kind().is_dir() {
            return Err(Error::NotADirectory);
        }
        node = node.lookup(name)?;
    }

    Ok((mount, node))
}

/// 打开时创建文件；并发创建时取已存在的那个
fn create_in(table: &MountTable, path: &str) -> Result<(Arc<Mount>, Arc<dyn Inode>)> {
    let (parent, name) = split_parent(path).ok_or(Error::InvalidArgument)?;
    let (mount, dir) = resolve_in(table, parent)?;
    if !dir.kind().is_dir() {
        return Err(Error::NotADirectory);
    }
    let inode = match dir.create(name, DEFAULT_FILE_MODE) {
        Err(Error::Exists) => dir.lookup(name)?,
        other => other?,
    };

    Ok((mount, inode))
}
