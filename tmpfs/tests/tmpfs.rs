use std::sync::Arc;

use tmpfs::{TmpFileSystem, TmpfsConfig};
use vfs::{Error, FileSystem, Inode, InodeKind, TickClock};

fn mounted(config: TmpfsConfig) -> TmpFileSystem {
    let fs = TmpFileSystem::new(config, Arc::new(TickClock::new()));
    fs.mount(None).unwrap();
    fs
}

fn names(dir: &Arc<dyn Inode>) -> Vec<String> {
    vfs::ReadDir::new(Arc::clone(dir))
        .map(|entry| entry.unwrap().name)
        .collect()
}

#[test]
fn remount_yields_empty_root() {
    let fs = mounted(TmpfsConfig::default());
    let root = fs.root().unwrap();
    root.create("a", 0o644).unwrap();
    root.mkdir("d", 0o755).unwrap();
    assert_eq!(vec!["a", "d"], names(&root));

    fs.unmount().unwrap();
    assert_eq!(Err(Error::NotFound), fs.root().map(drop));
    fs.mount(None).unwrap();
    assert!(names(&fs.root().unwrap()).is_empty());
}

#[test]
fn double_mount_is_busy() {
    let fs = mounted(TmpfsConfig::default());
    assert_eq!(Err(Error::Busy), fs.mount(None));
}

#[test]
fn file_read_write() {
    let fs = mounted(TmpfsConfig::default());
    let file = fs.root().unwrap().create("f", 0o644).unwrap();

    assert_eq!(5, file.write_at(0, b"hello").unwrap());
    assert_eq!(5, file.write_at(10, b"world").unwrap());

    let mut buf = [0xFF; 32];
    assert_eq!(15, file.read_at(0, &mut buf).unwrap());
    assert_eq!(b"hello\0\0\0\0\0world", &buf[..15]);
    assert_eq!(3, file.read_at(12, &mut buf).unwrap());
    assert_eq!(0, file.read_at(100, &mut buf).unwrap());

    file.truncate(2).unwrap();
    let stat = file.stat().unwrap();
    assert_eq!((InodeKind::Regular, 2, 1), (stat.kind, stat.size, stat.links));
}

#[test]
fn directory_contract() {
    let fs = mounted(TmpfsConfig::default());
    let root = fs.root().unwrap();
    let dir = root.mkdir("d", 0o755).unwrap();
    let file = dir.create("f", 0o644).unwrap();

    assert_eq!(Err(Error::Exists), root.mkdir("d", 0o755).map(drop));
    assert_eq!(Err(Error::NotFound), root.lookup("x").map(drop));
    assert_eq!(Err(Error::NotADirectory), file.lookup("x").map(drop));
    assert_eq!(Err(Error::IsADirectory), dir.read_at(0, &mut [0; 4]));
    assert_eq!(Err(Error::IsADirectory), root.unlink("d"));
    assert_eq!(Err(Error::NotEmpty), root.rmdir("d"));
    assert_eq!(Err(Error::NotADirectory), dir.rmdir("f"));
    assert_eq!(Err(Error::InvalidArgument), root.create("a/b", 0o644).map(drop));
    assert_eq!(Err(Error::NameTooLong), root.create(&"n".repeat(256), 0o644).map(drop));

    assert_eq!(3, root.stat().unwrap().links);
    dir.unlink("f").unwrap();
    root.rmdir("d").unwrap();
    assert_eq!(2, root.stat().unwrap().links);
    assert!(names(&root).is_empty());
}

#[test]
fn hard_links_share_content() {
    let fs = mounted(TmpfsConfig::default());
    let root = fs.root().unwrap();
    let file = root.create("a", 0o644).unwrap();
    file.write_at(0, b"shared").unwrap();

    root.link("b", &file).unwrap();
    assert_eq!(2, file.stat().unwrap().links);

    root.unlink("a").unwrap();
    let mut buf = [0; 6];
    root.lookup("b").unwrap().read_at(0, &mut buf).unwrap();
    assert_eq!(b"shared", &buf);
    assert_eq!(1, file.stat().unwrap().links);

    let other = mounted(TmpfsConfig::default());
    assert_eq!(
        Err(Error::InvalidArgument),
        other.root().unwrap().link("c", &file)
    );
}

#[test]
fn byte_budget() {
    let fs = mounted(TmpfsConfig {
        max_bytes: 16,
        max_inodes: 8,
    });
    let file = fs.root().unwrap().create("f", 0o644).unwrap();

    file.write_at(0, &[1; 16]).unwrap();
    assert_eq!(Err(Error::NoSpace), file.write_at(16, &[1]));
    // 覆写不占用新的预算
    file.write_at(0, &[2; 16]).unwrap();

    file.truncate(4).unwrap();
    file.write_at(4, &[3; 12]).unwrap();
}

#[test]
fn unlinked_file_frees_budget_on_last_close() {
    let fs = mounted(TmpfsConfig {
        max_bytes: 8,
        max_inodes: 8,
    });
    let root = fs.root().unwrap();
    let file = root.create("f", 0o644).unwrap();
    file.write_at(0, &[0; 8]).unwrap();

    root.unlink("f").unwrap();
    // 句柄仍然存活，内容可读，预算未归还
    assert_eq!(8, file.read_at(0, &mut [0; 8]).unwrap());
    assert_eq!(Err(Error::NoSpace), root.create("g", 0o644).unwrap().write_at(0, &[0]));

    drop(file);
    root.lookup("g").unwrap().write_at(0, &[0; 8]).unwrap();
}

#[test]
fn inode_budget() {
    let fs = mounted(TmpfsConfig {
        max_bytes: 1024,
        max_inodes: 3,
    });
    let root = fs.root().unwrap();
    root.create("a", 0o644).unwrap();
    root.mkdir("b", 0o755).unwrap();
    assert_eq!(Err(Error::NoSpace), root.create("c", 0o644).map(drop));

    let stat = fs.stat_fs().unwrap();
    assert_eq!((3, 0), (stat.total_inodes, stat.free_inodes));

    root.unlink("a").unwrap();
    root.create("c", 0o644).unwrap();
}

#[test]
fn read_dir_is_restartable() {
    let fs = mounted(TmpfsConfig::default());
    let root = fs.root().unwrap();
    for name in ["x", "y", "z"] {
        root.create(name, 0o644).unwrap();
    }

    let mut entries = vfs::ReadDir::new(Arc::clone(&root));
    assert_eq!("x", entries.next().unwrap().unwrap().name);
    entries.rewind();
    let all: Vec<_> = entries.map(|entry| entry.unwrap().name).collect();
    assert_eq!(vec!["x", "y", "z"], all);
}

#[test]
fn timestamps_come_from_clock() {
    let fs = mounted(TmpfsConfig::default());
    let file = fs.root().unwrap().create("f", 0o644).unwrap();
    let before = file.stat().unwrap();

    file.write_at(0, b"x").unwrap();
    let after = file.stat().unwrap();
    assert!(after.mtime > before.mtime);
    assert_eq!(0o644, after.mode);

    // 读取不改动访问时间
    file.read_at(0, &mut [0; 1]).unwrap();
    assert_eq!(after.atime, file.stat().unwrap().atime);
}

#[test]
fn empty_write_keeps_size() {
    let fs = mounted(TmpfsConfig::default());
    let file = fs.root().unwrap().create("f", 0o644).unwrap();
    let before = file.stat().unwrap();

    assert_eq!(0, file.write_at(100, &[]).unwrap());
    let after = file.stat().unwrap();
    assert_eq!(0, after.size);
    assert_eq!(before.mtime, after.mtime);
    let stat = fs.stat_fs().unwrap();
    assert_eq!(stat.total_blocks, stat.free_blocks);
}

#[test]
fn removed_directory_takes_no_entries() {
    let fs = mounted(TmpfsConfig::default());
    let root = fs.root().unwrap();
    let dir = root.mkdir("d", 0o755).unwrap();
    let file = root.create("f", 0o644).unwrap();

    root.rmdir("d").unwrap();
    assert_eq!(0, dir.stat().unwrap().links);
    assert_eq!(Err(Error::NotFound), dir.create("late", 0o644).map(drop));
    assert_eq!(Err(Error::NotFound), dir.mkdir("late", 0o755).map(drop));
    assert_eq!(Err(Error::NotFound), dir.symlink("late", "/f").map(drop));
    assert_eq!(Err(Error::NotFound), dir.link("late", &file));
    assert_eq!(Err(Error::NotFound), root.rename("f", &dir, "f"));
    assert!(names(&dir).is_empty());
    assert_eq!(vec!["f"], names(&root));
}

#[test]
fn rename_moves_entries() {
    let fs = mounted(TmpfsConfig::default());
    let root = fs.root().unwrap();
    let a = root.mkdir("a", 0o755).unwrap();
    let b = root.mkdir("b", 0o755).unwrap();
    let file = a.create("f", 0o644).unwrap();
    file.write_at(0, b"moved").unwrap();

    a.rename("f", &a, "g").unwrap();
    assert_eq!(vec!["g"], names(&a));
    a.rename("g", &b, "h").unwrap();
    assert!(names(&a).is_empty());
    let mut buf = [0; 5];
    b.lookup("h").unwrap().read_at(0, &mut buf).unwrap();
    assert_eq!(b"moved", &buf);
    assert_eq!(file.stat().unwrap().ino, b.lookup("h").unwrap().stat().unwrap().ino);

    // 目录搬家后 `..` 的计数随之变化
    root.rename("b", &a, "b").unwrap();
    assert_eq!(3, root.stat().unwrap().links);
    assert_eq!(3, a.stat().unwrap().links);
    assert_eq!(vec!["a"], names(&root));
    a.rename("b", &root, "c").unwrap();
    assert_eq!(4, root.stat().unwrap().links);
    assert_eq!(2, a.stat().unwrap().links);

    // 原名改原名不做任何事
    root.rename("c", &root, "c").unwrap();
    assert_eq!(vec!["a", "c"], names(&root));
}

#[test]
fn rename_refusals() {
    let fs = mounted(TmpfsConfig::default());
    let root = fs.root().unwrap();
    let a = root.mkdir("a", 0o755).unwrap();
    let inner = a.mkdir("inner", 0o755).unwrap();
    let file = root.create("f", 0o644).unwrap();
    root.create("g", 0o644).unwrap();

    assert_eq!(Err(Error::Exists), root.rename("f", &root, "g"));
    assert_eq!(Err(Error::NotFound), root.rename("x", &root, "y"));
    assert_eq!(Err(Error::InvalidArgument), root.rename("a", &a, "self"));
    assert_eq!(Err(Error::InvalidArgument), root.rename("a", &inner, "a"));
    assert_eq!(Err(Error::InvalidArgument), root.rename("f", &root, "x/y"));
    assert_eq!(Err(Error::NotADirectory), file.rename("f", &root, "h"));

    let other = mounted(TmpfsConfig::default());
    assert_eq!(
        Err(Error::InvalidArgument),
        root.rename("f", &other.root().unwrap(), "f")
    );
    assert_eq!(vec!["a", "f", "g"], names(&root));
}

#[test]
fn symlinks_keep_their_target() {
    let fs = mounted(TmpfsConfig::default());
    let root = fs.root().unwrap();
    let link = root.symlink("l", "../somewhere/else").unwrap();
    let file = root.create("f", 0o644).unwrap();

    let stat = link.stat().unwrap();
    assert_eq!((InodeKind::SymLink, 17, 0o777), (stat.kind, stat.size, stat.mode));
    assert_eq!(Ok("../somewhere/else".to_string()), link.read_link());
    assert_eq!(Err(Error::InvalidArgument), file.read_link());
    assert_eq!(Err(Error::InvalidArgument), link.read_at(0, &mut [0; 4]));
    assert_eq!(Err(Error::InvalidArgument), link.write_at(0, b"x"));
    assert_eq!(Err(Error::NotADirectory), link.lookup("x").map(drop));

    assert_eq!(Err(Error::Exists), root.symlink("l", "/f").map(drop));
    assert_eq!(Err(Error::NotFound), root.symlink("e", "").map(drop));
    assert_eq!(
        Err(Error::NameTooLong),
        root.symlink("long", &"p".repeat(4097)).map(drop)
    );

    let free = fs.stat_fs().unwrap().free_inodes;
    drop(link);
    root.unlink("l").unwrap();
    assert_eq!(free + 1, fs.stat_fs().unwrap().free_inodes);
}
