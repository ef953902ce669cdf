use vfs::path::{components, is_prefix, normalize, split_parent};
use vfs::{Error, NAME_MAX, check_name};

#[test]
fn normalize_is_lexical() {
    assert_eq!("/", normalize(""));
    assert_eq!("/", normalize("/"));
    assert_eq!("/", normalize("/.."));
    assert_eq!("/a/b", normalize("//a///b/"));
    assert_eq!("/a/c", normalize("/a/./b/../c"));
    assert_eq!("/c", normalize("/a/../../c"));
    assert_eq!("/rel/path", normalize("rel/path"));
}

#[test]
fn parent_and_name() {
    assert_eq!(Some(("/", "a")), split_parent("/a"));
    assert_eq!(Some(("/a/b", "c")), split_parent("/a/b/c"));
    assert_eq!(None, split_parent("/"));
}

#[test]
fn prefix_on_component_boundary() {
    assert!(is_prefix("/", "/anything"));
    assert!(is_prefix("/mnt", "/mnt"));
    assert!(is_prefix("/mnt", "/mnt/disk"));
    assert!(!is_prefix("/mnt", "/mntx"));
    assert!(!is_prefix("/mnt/disk", "/mnt"));

    let rest: Vec<_> = components("/mnt", "/mnt/a/b").collect();
    assert_eq!(vec!["a", "b"], rest);
    assert_eq!(0, components("/mnt", "/mnt").count());
    assert_eq!(vec!["x"], components("/", "/x").collect::<Vec<_>>());
}

#[test]
fn name_rules() {
    assert!(check_name("file.txt").is_ok());
    for bad in ["", ".", "..", "a/b", "nul\0"] {
        assert_eq!(Err(Error::InvalidArgument), check_name(bad));
    }
    assert!(check_name(&"x".repeat(NAME_MAX)).is_ok());
    assert_eq!(Err(Error::NameTooLong), check_name(&"x".repeat(NAME_MAX + 1)));
}
