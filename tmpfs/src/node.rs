use alloc::{
    collections::BTreeMap,
    string::{String, ToString},
    sync::{Arc, Weak},
    vec::Vec,
};
use core::{any::Any, fmt, ptr};

use spin::{Mutex, RwLock};
use vfs::{DirEntry, Error, Inode, InodeKind, PATH_MAX, Result, Stat, check_name};

use crate::{BLOCK_SIZE, Shared};

enum Content {
    File(Vec<u8>),
    Dir(BTreeMap<String, Arc<TmpNode>>),
    Link(String),
}

#[derive(Debug, Clone, Copy)]
struct Meta {
    mode: u16,
    links: u32,
    atime: u64,
    mtime: u64,
    ctime: u64,
}

/// 内存中的文件、目录或符号链接
pub struct TmpNode {
    ino: u64,
    kind: InodeKind,
    shared: Arc<Shared>,
    /// 建立硬链接时取回自身的 `Arc`
    this: Weak<TmpNode>,
    /// 所在目录，只对目录有意义；根目录为空
    parent: Mutex<Weak<TmpNode>>,
    meta: Mutex<Meta>,
    content: RwLock<Content>,
}

impl TmpNode {
    pub(crate) fn new_dir(
        shared: &Arc<Shared>,
        mode: u16,
        parent: Weak<TmpNode>,
    ) -> Result<Arc<Self>> {
        Self::new(
            shared,
            InodeKind::Directory,
            mode,
            2,
            parent,
            Content::Dir(BTreeMap::new()),
        )
    }

    fn new_file(shared: &Arc<Shared>, mode: u16) -> Result<Arc<Self>> {
        Self::new(
            shared,
            InodeKind::Regular,
            mode,
            1,
            Weak::new(),
            Content::File(Vec::new()),
        )
    }

    fn new_link(shared: &Arc<Shared>, target: &str) -> Result<Arc<Self>> {
        Self::new(
            shared,
            InodeKind::SymLink,
            0o777,
            1,
            Weak::new(),
            Content::Link(target.to_string()),
        )
    }

    fn new(
        shared: &Arc<Shared>,
        kind: InodeKind,
        mode: u16,
        links: u32,
        parent: Weak<TmpNode>,
        content: Content,
    ) -> Result<Arc<Self>> {
        let ino = shared.reserve_inode()?;
        let now = shared.now();

        Ok(Arc::new_cyclic(|this| Self {
            ino,
            kind,
            shared: Arc::clone(shared),
            this: Weak::clone(this),
            parent: Mutex::new(parent),
            meta: Mutex::new(Meta {
                mode: mode & 0o7777,
                links,
                atime: now,
                mtime: now,
                ctime: now,
            }),
            content: RwLock::new(content),
        }))
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// 对非普通文件做文件读写时的错误
    fn not_a_file(&self) -> Error {
        if self.kind.is_dir() {
            Error::IsADirectory
        } else {
            Error::InvalidArgument
        }
    }

    fn touch_modified(&self) {
        let now = self.shared.now();
        let mut meta = self.meta.lock();
        meta.mtime = now;
        meta.ctime = now;
    }

    /// 取回同一次挂载中的节点
    fn same_fs(&self, node: &Arc<dyn Inode>) -> Result<Arc<TmpNode>> {
        node.as_any()
            .downcast_ref::<TmpNode>()
            .filter(|node| Arc::ptr_eq(&node.shared, &self.shared))
            .and_then(|node| node.this.upgrade())
            .ok_or(Error::InvalidArgument)
    }

    /// `node` 是否为本目录的上级目录
    fn has_ancestor(&self, node: &TmpNode) -> bool {
        let mut current = self.parent.lock().upgrade();
        while let Some(dir) = current {
            if ptr::eq(Arc::as_ptr(&dir), node) {
                return true;
            }
            current = dir.parent.lock().upgrade();
        }
        false
    }

    /// 在本目录中插入新建的子节点。目录已被删除时返回 [`Error::NotFound`]。
    fn insert_child(
        &self,
        name: &str,
        make: impl FnOnce() -> Result<Arc<TmpNode>>,
    ) -> Result<Arc<TmpNode>> {
        check_name(name)?;
        let mut content = self.content.write();
        let Content::Dir(children) = &mut *content else {
            return Err(Error::NotADirectory);
        };
        if self.meta.lock().links == 0 {
            return Err(Error::NotFound);
        }
        if children.contains_key(name) {
            return Err(Error::Exists);
        }

        let child = make()?;
        children.insert(name.to_string(), Arc::clone(&child));
        drop(content);
        self.touch_modified();

        Ok(child)
    }

    /// 从 `from` 取出 `name` 放入 `to`，调用者已锁住两个目录
    fn move_child(
        &self,
        from: &mut Content,
        name: &str,
        new_dir: &Arc<TmpNode>,
        to: &mut Content,
        new_name: &str,
    ) -> Result<()> {
        let (Content::Dir(from), Content::Dir(to)) = (from, to) else {
            return Err(Error::NotADirectory);
        };
        if new_dir.meta.lock().links == 0 {
            return Err(Error::NotFound);
        }
        if to.contains_key(new_name) {
            return Err(Error::Exists);
        }

        let child = from.remove(name).ok_or(Error::NotFound)?;
        if child.kind.is_dir() {
            *child.parent.lock() = Weak::clone(&new_dir.this);
            self.meta.lock().links -= 1;
            new_dir.meta.lock().links += 1;
        }
        child.meta.lock().ctime = self.shared.now();
        to.insert(new_name.to_string(), child);

        Ok(())
    }
}

impl Inode for TmpNode {
    fn kind(&self) -> InodeKind {
        self.kind
    }

    fn stat(&self) -> Result<Stat> {
        let size = match &*self.content.read() {
            Content::File(data) => data.len() as u64,
            Content::Dir(children) => children.len() as u64,
            Content::Link(target) => target.len() as u64,
        };
        let meta = *self.meta.lock();

        Ok(Stat {
            ino: self.ino,
            kind: self.kind,
            mode: meta.mode,
            size,
            links: meta.links,
            blocks: size.div_ceil(512),
            block_size: BLOCK_SIZE,
            atime: meta.atime,
            mtime: meta.mtime,
            ctime: meta.ctime,
        })
    }

    /// 读取不更新访问时间
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let content = self.content.read();
        let Content::File(data) = &*content else {
            return Err(self.not_a_file());
        };

        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let len = buf.len().min(data.len() - start);
        buf[..len].copy_from_slice(&data[start..start + len]);

        Ok(len)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        let mut content = self.content.write();
        let Content::File(data) = &mut *content else {
            return Err(self.not_a_file());
        };
        if buf.is_empty() {
            return Ok(0);
        }

        let end = offset
            .checked_add(buf.len() as u64)
            .and_then(|end| usize::try_from(end).ok())
            .ok_or(Error::NoSpace)?;
        if end > data.len() {
            self.shared.reserve_bytes((end - data.len()) as u64)?;
            data.resize(end, 0);
        }
        data[end - buf.len()..end].copy_from_slice(buf);
        drop(content);
        self.touch_modified();

        Ok(buf.len())
    }

    fn truncate(&self, size: u64) -> Result<()> {
        let mut content = self.content.write();
        let Content::File(data) = &mut *content else {
            return Err(self.not_a_file());
        };

        let size = usize::try_from(size).map_err(|_| Error::NoSpace)?;
        if size > data.len() {
            self.shared.reserve_bytes((size - data.len()) as u64)?;
        } else {
            self.shared.release_bytes((data.len() - size) as u64);
        }
        data.resize(size, 0);
        drop(content);
        self.touch_modified();

        Ok(())
    }

    fn lookup(&self, name: &str) -> Result<Arc<dyn Inode>> {
        let content = self.content.read();
        let Content::Dir(children) = &*content else {
            return Err(Error::NotADirectory);
        };

        children
            .get(name)
            .map(|child| Arc::clone(child) as Arc<dyn Inode>)
            .ok_or(Error::NotFound)
    }

    fn create(&self, name: &str, mode: u16) -> Result<Arc<dyn Inode>> {
        let child = self.insert_child(name, || TmpNode::new_file(&self.shared, mode))?;
        Ok(child)
    }

    fn mkdir(&self, name: &str, mode: u16) -> Result<Arc<dyn Inode>> {
        let parent = Weak::clone(&self.this);
        let child = self.insert_child(name, || TmpNode::new_dir(&self.shared, mode, parent))?;
        // 子目录的 `..`
        self.meta.lock().links += 1;
        Ok(child)
    }

    fn unlink(&self, name: &str) -> Result<()> {
        let mut content = self.content.write();
        let Content::Dir(children) = &mut *content else {
            return Err(Error::NotADirectory);
        };
        let child = children.get(name).ok_or(Error::NotFound)?;
        if child.kind.is_dir() {
            return Err(Error::IsADirectory);
        }

        let child = children.remove(name).ok_or(Error::NotFound)?;
        drop(content);
        {
            let mut meta = child.meta.lock();
            meta.links -= 1;
            meta.ctime = self.shared.now();
        }
        self.touch_modified();

        // 最后一个引用消失时节点随之销毁
        drop(child);
        Ok(())
    }

    fn rmdir(&self, name: &str) -> Result<()> {
        let mut content = self.content.write();
        let Content::Dir(children) = &mut *content else {
            return Err(Error::NotADirectory);
        };
        let child = children.get(name).ok_or(Error::NotFound)?;
        if !child.kind.is_dir() {
            return Err(Error::NotADirectory);
        }
        {
            // 持有子目录的写锁，检查与标记之间不能有新的子项插入
            let grandchildren = child.content.write();
            if matches!(&*grandchildren, Content::Dir(entries) if !entries.is_empty()) {
                return Err(Error::NotEmpty);
            }
            child.meta.lock().links = 0;
        }

        children.remove(name);
        drop(content);
        self.meta.lock().links -= 1;
        self.touch_modified();

        Ok(())
    }

    fn link(&self, name: &str, target: &Arc<dyn Inode>) -> Result<()> {
        let target = self.same_fs(target)?;
        if target.kind.is_dir() {
            return Err(Error::IsADirectory);
        }

        self.insert_child(name, || Ok(Arc::clone(&target)))?;
        let mut meta = target.meta.lock();
        meta.links += 1;
        meta.ctime = self.shared.now();

        Ok(())
    }

    fn rename(&self, name: &str, new_dir: &Arc<dyn Inode>, new_name: &str) -> Result<()> {
        check_name(new_name)?;
        let new_dir = self.same_fs(new_dir)?;
        let this = self.this.upgrade().ok_or(Error::NotFound)?;
        // 同一文件系统内的改名依次进行，目录的上下级关系在此期间不变
        let _serial = self.shared.rename_lock.lock();

        let child = match self.lookup(name)?.as_any().downcast_ref::<TmpNode>() {
            Some(child) => child.this.upgrade().ok_or(Error::NotFound)?,
            None => return Err(Error::NotFound),
        };
        if Arc::ptr_eq(&this, &new_dir) && name == new_name {
            return Ok(());
        }
        if child.kind.is_dir() && (Arc::ptr_eq(&child, &new_dir) || new_dir.has_ancestor(&child)) {
            return Err(Error::InvalidArgument);
        }

        if Arc::ptr_eq(&this, &new_dir) {
            let mut content = self.content.write();
            let Content::Dir(children) = &mut *content else {
                return Err(Error::NotADirectory);
            };
            if children.contains_key(new_name) {
                return Err(Error::Exists);
            }
            let child = children.remove(name).ok_or(Error::NotFound)?;
            child.meta.lock().ctime = self.shared.now();
            children.insert(new_name.to_string(), child);
        } else if this.has_ancestor(&new_dir) {
            // 上级目录先上锁，与 rmdir 的顺序一致
            let mut to = new_dir.content.write();
            let mut from = self.content.write();
            self.move_child(&mut from, name, &new_dir, &mut to, new_name)?;
        } else {
            let mut from = self.content.write();
            let mut to = new_dir.content.write();
            self.move_child(&mut from, name, &new_dir, &mut to, new_name)?;
        }

        self.touch_modified();
        if !Arc::ptr_eq(&this, &new_dir) {
            new_dir.touch_modified();
        }

        Ok(())
    }

    fn symlink(&self, name: &str, target: &str) -> Result<Arc<dyn Inode>> {
        if target.is_empty() {
            return Err(Error::NotFound);
        }
        if target.len() > PATH_MAX {
            return Err(Error::NameTooLong);
        }

        let link = self.insert_child(name, || TmpNode::new_link(&self.shared, target))?;
        Ok(link)
    }

    fn read_link(&self) -> Result<String> {
        match &*self.content.read() {
            Content::Link(target) => Ok(target.clone()),
            _ => Err(Error::InvalidArgument),
        }
    }

    fn read_dir_at(&self, cursor: usize) -> Result<Option<(DirEntry, usize)>> {
        let content = self.content.read();
        let Content::Dir(children) = &*content else {
            return Err(Error::NotADirectory);
        };

        Ok(children.iter().nth(cursor).map(|(name, child)| {
            let entry = DirEntry {
                ino: child.ino,
                kind: child.kind,
                name: name.clone(),
            };
            (entry, cursor + 1)
        }))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for TmpNode {
    fn drop(&mut self) {
        if let Content::File(data) = self.content.get_mut() {
            self.shared.release_bytes(data.len() as u64);
        }
        self.shared.release_inode();
    }
}

impl fmt::Debug for TmpNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TmpNode")
            .field("ino", &self.ino)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}
