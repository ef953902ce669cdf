use std::sync::Arc;

use vfs::{Error, InodeKind, OpenFlag, PathError, Registry, SeekFrom, TickClock, Vfs};

fn vfs_with_tmpfs() -> Vfs {
    let mut registry = Registry::new();
    tmpfs::register(&mut registry, Default::default(), Arc::new(TickClock::new())).unwrap();
    let vfs = Vfs::new(registry, None);
    vfs.mount("/", "tmpfs", None).unwrap();
    vfs
}

fn kind(result: Result<impl Sized, PathError>) -> Error {
    match result {
        Ok(_) => panic!("expected an error"),
        Err(err) => err.error,
    }
}

#[test]
fn duplicate_registration() {
    let mut registry = Registry::new();
    let clock = Arc::new(TickClock::new());
    tmpfs::register(&mut registry, Default::default(), clock.clone()).unwrap();
    assert_eq!(
        Err(Error::DuplicateName),
        tmpfs::register(&mut registry, Default::default(), clock)
    );
    assert_eq!(vec!["tmpfs"], registry.names());
    assert!(matches!(registry.create("ext9"), Err(Error::UnknownFilesystem)));
}

#[test]
fn mount_point_rules() {
    let vfs = vfs_with_tmpfs();

    assert_eq!(Error::Busy, kind(vfs.mount("/", "tmpfs", None)));
    assert_eq!(Error::NotFound, kind(vfs.mount("/mnt", "tmpfs", None)));
    vfs.create("/file").unwrap();
    assert_eq!(Error::NotADirectory, kind(vfs.mount("/file", "tmpfs", None)));
    vfs.mkdir("/mnt").unwrap();
    assert_eq!(Error::UnknownFilesystem, kind(vfs.mount("/mnt", "nope", None)));

    vfs.mount("/mnt/", "tmpfs", None).unwrap();
    assert_eq!(2, vfs.mounts().len());
    assert_eq!(Error::NotFound, kind(vfs.unmount("/elsewhere")));
}

#[test]
fn longest_prefix_wins() {
    let vfs = vfs_with_tmpfs();
    vfs.mkdir("/mnt").unwrap();
    vfs.mkdir("/mntx").unwrap();
    vfs.mount("/mnt", "tmpfs", None).unwrap();

    vfs.create("/mnt/inner").unwrap();
    vfs.create("/mntx/outer").unwrap();

    // /mnt 下的内容属于新挂载，/mntx 仍在根上
    let root_names: Vec<_> = vfs
        .read_dir("/")
        .unwrap()
        .map(|entry| entry.unwrap().name)
        .collect();
    assert_eq!(vec!["mnt", "mntx"], root_names);
    assert!(vfs.stat("/mnt/inner").is_ok());
    assert!(vfs.stat("/mntx/outer").is_ok());
    assert!(vfs.stat("/mnt/../mntx/./outer").is_ok());

    vfs.unmount("/mnt").unwrap();
    assert_eq!(Error::NotFound, kind(vfs.stat("/mnt/inner")));
}

#[test]
fn open_handles_keep_mount_busy() {
    let vfs = vfs_with_tmpfs();
    vfs.mkdir("/mnt").unwrap();
    vfs.mount("/mnt", "tmpfs", None).unwrap();

    let file = vfs
        .open("/mnt/f", OpenFlag::Write | OpenFlag::Create)
        .unwrap();
    assert_eq!(Error::Busy, kind(vfs.unmount("/mnt")));
    assert_eq!(1, vfs.mounts()[1].open);

    let listing = vfs.read_dir("/mnt").unwrap();
    drop(file);
    assert_eq!(Error::Busy, kind(vfs.unmount("/mnt")));
    drop(listing);

    vfs.unmount("/mnt").unwrap();
}

#[test]
fn nested_mount_keeps_parent_busy() {
    let vfs = vfs_with_tmpfs();
    vfs.mkdir("/a").unwrap();
    vfs.mount("/a", "tmpfs", None).unwrap();
    vfs.mkdir("/a/b").unwrap();
    vfs.mount("/a/b", "tmpfs", None).unwrap();

    assert_eq!(Error::Busy, kind(vfs.unmount("/a")));
    assert_eq!(Error::Busy, kind(vfs.rmdir("/a/b")));
    vfs.unmount("/a/b").unwrap();
    vfs.unmount("/a").unwrap();
}

#[test]
fn file_handle_io() {
    let vfs = vfs_with_tmpfs();

    let mut file = vfs
        .open("/notes", OpenFlag::Read | OpenFlag::Write | OpenFlag::Create)
        .unwrap();
    file.write_all(b"hello world").unwrap();
    assert_eq!(6, file.seek(SeekFrom::Start(6)).unwrap());
    let mut buf = [0; 5];
    assert_eq!(5, file.read(&mut buf).unwrap());
    assert_eq!(b"world", &buf);
    assert_eq!(
        Error::InvalidArgument,
        kind(file.seek(SeekFrom::Current(-100)))
    );
    file.close().unwrap();

    let mut appender = vfs
        .open("/notes", OpenFlag::Write | OpenFlag::Append)
        .unwrap();
    appender.write_all(b"!").unwrap();
    drop(appender);

    let mut reader = vfs.open("/notes", OpenFlag::Read.into()).unwrap();
    let mut all = Vec::new();
    reader.read_to_end(&mut all).unwrap();
    assert_eq!(b"hello world!".to_vec(), all);
    assert_eq!(Error::InvalidArgument, kind(reader.write(b"x")));

    let truncated = vfs
        .open("/notes", OpenFlag::Write | OpenFlag::Truncate)
        .unwrap();
    assert_eq!(0, truncated.stat().unwrap().size);
}

#[test]
fn errors_carry_the_path() {
    let vfs = vfs_with_tmpfs();
    let err = vfs.open("/missing/file", OpenFlag::Read.into()).unwrap_err();

    assert_eq!("/missing/file", err.path);
    assert_eq!(Error::NotFound, err.error);
    assert_eq!("/missing/file: no such file or directory", err.to_string());
}

#[test]
fn directories_cannot_be_written() {
    let vfs = vfs_with_tmpfs();
    vfs.mkdir("/d").unwrap();

    assert_eq!(
        Error::IsADirectory,
        kind(vfs.open("/d", OpenFlag::Write.into()))
    );
    let dir = vfs.open("/d", OpenFlag::Read.into()).unwrap();
    assert_eq!(0, dir.read_dir().unwrap().count());
    vfs.create("/d/x").unwrap();
    assert_eq!(Error::NotADirectory, kind(vfs.read_dir("/d/x/y")));
    assert_eq!(Error::NotADirectory, kind(vfs.read_dir("/d/x")));
    assert_eq!(Error::Exists, kind(vfs.mkdir("/")));
}

#[test]
fn link_within_one_mount() {
    let vfs = vfs_with_tmpfs();
    vfs.mkdir("/mnt").unwrap();
    vfs.mount("/mnt", "tmpfs", None).unwrap();
    vfs.create("/a").unwrap();

    vfs.link("/a", "/b").unwrap();
    assert_eq!(2, vfs.stat("/b").unwrap().links);
    assert_eq!(Error::InvalidArgument, kind(vfs.link("/a", "/mnt/c")));
    assert_eq!(Error::Exists, kind(vfs.link("/a", "/b")));

    vfs.unlink("/a").unwrap();
    assert_eq!(1, vfs.stat("/b").unwrap().links);
    vfs.sync().unwrap();
}

#[test]
fn rename_within_one_mount() {
    let vfs = vfs_with_tmpfs();
    vfs.mkdir("/dir").unwrap();
    vfs.mkdir("/mnt").unwrap();
    vfs.mount("/mnt", "tmpfs", None).unwrap();
    vfs.create("/a").unwrap();

    vfs.rename("/a", "/dir/b").unwrap();
    assert_eq!(Error::NotFound, kind(vfs.stat("/a")));
    assert!(vfs.stat("/dir/b").is_ok());
    vfs.rename("/dir", "/renamed").unwrap();
    assert!(vfs.stat("/renamed/b").is_ok());

    assert_eq!(Error::InvalidArgument, kind(vfs.rename("/renamed/b", "/mnt/b")));
    assert_eq!(Error::InvalidArgument, kind(vfs.rename("/renamed", "/renamed/sub")));
    assert_eq!(Error::Busy, kind(vfs.rename("/mnt", "/elsewhere")));
    assert_eq!(Error::Busy, kind(vfs.rename("/renamed/b", "/mnt")));
    assert_eq!(Error::Busy, kind(vfs.rename("/", "/x")));
    assert_eq!(Error::NotFound, kind(vfs.rename("/nothing", "/x")));
}

#[test]
fn symlinks_are_not_followed() {
    let vfs = vfs_with_tmpfs();
    vfs.mkdir("/d").unwrap();
    vfs.create("/d/f").unwrap();
    vfs.symlink("/d", "/link").unwrap();

    assert_eq!("/d", vfs.read_link("/link").unwrap());
    assert_eq!(InodeKind::SymLink, vfs.stat("/link").unwrap().kind);
    assert_eq!(Error::NotADirectory, kind(vfs.stat("/link/f")));
    assert_eq!(
        Error::InvalidArgument,
        kind(vfs.open("/link", OpenFlag::Read.into()))
    );
    assert_eq!(Error::InvalidArgument, kind(vfs.read_link("/d/f")));
    assert_eq!(Error::Exists, kind(vfs.symlink("/d", "/link")));

    vfs.unlink("/link").unwrap();
    assert!(vfs.stat("/d/f").is_ok());
}
