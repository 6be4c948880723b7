use std::fs;
use std::io::{Cursor, Read};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use layerdiff::{
    Change, ChangeKind, DiffDriver, DirDriver, GraphDriverError, IdMap, IdMappings,
    NaiveDiffDriver,
};
use serial_test::serial;
use tempfile::TempDir;

struct Fixture {
    _root: TempDir,
    dir: Arc<DirDriver>,
    driver: NaiveDiffDriver,
}

impl Fixture {
    fn new() -> Result<Self> {
        Self::with_mappings(IdMappings::default())
    }

    fn with_mappings(id_mappings: IdMappings) -> Result<Self> {
        let root = TempDir::new()?;
        let dir = Arc::new(DirDriver::new(root.path().join("layers"))?);
        let driver = NaiveDiffDriver::new(dir.clone(), id_mappings);
        Ok(Self { _root: root, dir, driver })
    }

    fn layer(&self, id: &str) -> std::path::PathBuf {
        self.dir.root().join(id)
    }

    fn assert_unmounted(&self, ids: &[&str]) {
        for id in ids {
            assert_eq!(self.dir.mount_count(id), 0, "layer {} still mounted", id);
        }
    }

    fn diff_bytes(&self, id: &str, parent: Option<&str>) -> Result<Vec<u8>> {
        let mut stream = self.driver.diff(id, parent)?;
        let mut bytes = Vec::new();
        stream.read_to_end(&mut bytes)?;
        stream.close()?;
        Ok(bytes)
    }
}

/// Base layer with a small tree, and a child that adds, modifies and
/// deletes entries.
fn base_and_child(fx: &Fixture) -> Result<()> {
    fx.dir.create("base", None)?;
    let base = fx.layer("base");
    fs::create_dir_all(base.join("etc/conf.d"))?;
    fs::write(base.join("etc/hostname"), b"base")?;
    fs::write(base.join("etc/conf.d/a.conf"), b"a=1")?;
    fs::create_dir_all(base.join("usr/bin"))?;
    fs::write(base.join("usr/bin/tool"), b"#!/bin/sh\n")?;
    fs::set_permissions(base.join("usr/bin/tool"), fs::Permissions::from_mode(0o755))?;
    fs::create_dir_all(base.join("var/cache/old"))?;
    fs::write(base.join("var/cache/old/blob"), b"stale")?;

    fx.dir.create("child", Some("base"))?;
    let child = fx.layer("child");
    fs::write(child.join("etc/hostname"), b"child-host")?;
    fs::write(child.join("etc/motd"), b"welcome")?;
    fs::remove_file(child.join("etc/conf.d/a.conf"))?;
    fs::remove_dir_all(child.join("var/cache/old"))?;
    std::os::unix::fs::symlink("hostname", child.join("etc/hostname.link"))?;
    fs::hard_link(child.join("etc/motd"), child.join("etc/motd.hard"))?;
    Ok(())
}

fn tree_snapshot(root: &Path) -> Result<Vec<(String, u32, Option<Vec<u8>>)>> {
    let mut entries = Vec::new();
    for entry in walkdir::WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let rel = entry.path().strip_prefix(root)?.to_string_lossy().into_owned();
        let meta = entry.path().symlink_metadata()?;
        let content = if meta.file_type().is_file() {
            Some(fs::read(entry.path())?)
        } else if meta.file_type().is_symlink() {
            Some(fs::read_link(entry.path())?.to_string_lossy().into_owned().into_bytes())
        } else {
            None
        };
        entries.push((rel, meta.mode(), content));
    }
    Ok(entries)
}

#[test]
fn test_changes_without_parent_lists_every_path_as_add() -> Result<()> {
    let fx = Fixture::new()?;
    base_and_child(&fx)?;

    let changes = fx.driver.changes("base", None)?;
    let walked = walkdir::WalkDir::new(fx.layer("base")).min_depth(1).into_iter().count();

    assert_eq!(changes.len(), walked);
    assert!(changes.iter().all(|c| c.kind == ChangeKind::Add));
    assert!(changes.contains(&Change::new("/usr/bin/tool", ChangeKind::Add)));
    fx.assert_unmounted(&["base"]);
    Ok(())
}

#[test]
fn test_changes_against_parent() -> Result<()> {
    let fx = Fixture::new()?;
    base_and_child(&fx)?;

    let changes = fx.driver.changes("child", Some("base"))?;
    let find = |path: &str| changes.iter().find(|c| c.path == path).map(|c| c.kind);

    assert_eq!(find("/etc"), Some(ChangeKind::Modify));
    assert_eq!(find("/etc/hostname"), Some(ChangeKind::Modify));
    assert_eq!(find("/etc/motd"), Some(ChangeKind::Add));
    assert_eq!(find("/etc/hostname.link"), Some(ChangeKind::Add));
    assert_eq!(find("/etc/conf.d/a.conf"), Some(ChangeKind::Delete));
    assert_eq!(find("/var/cache/old"), Some(ChangeKind::Delete));
    // Only the top-most deletion is reported.
    assert_eq!(find("/var/cache/old/blob"), None);
    assert_eq!(find("/usr/bin/tool"), None);
    fx.assert_unmounted(&["base", "child"]);
    Ok(())
}

#[test]
fn test_full_diff_reproduces_layer_in_empty_directory() -> Result<()> {
    let fx = Fixture::new()?;
    base_and_child(&fx)?;

    let bytes = fx.diff_bytes("base", None)?;
    fx.assert_unmounted(&["base"]);

    fx.dir.create("copy", None)?;
    fx.driver.apply_diff("copy", None, &mut Cursor::new(bytes))?;

    assert_eq!(tree_snapshot(&fx.layer("copy"))?, tree_snapshot(&fx.layer("base"))?);
    let owner = fs::metadata(fx.layer("copy/etc/hostname"))?;
    let original = fs::metadata(fx.layer("base/etc/hostname"))?;
    assert_eq!((owner.uid(), owner.gid()), (original.uid(), original.gid()));
    fx.assert_unmounted(&["base", "copy"]);
    Ok(())
}

#[test]
fn test_parent_diff_records_container_ownership() -> Result<()> {
    let scratch = TempDir::new()?;
    let meta = fs::metadata(scratch.path())?;
    let mappings = IdMappings::new(
        vec![IdMap::new(0, meta.uid(), 1)],
        vec![IdMap::new(0, meta.gid(), 1)],
    );
    let fx = Fixture::with_mappings(mappings)?;
    base_and_child(&fx)?;

    // Host ids are written as container ids, root of the mapping here.
    let bytes = fx.diff_bytes("child", Some("base"))?;
    let mut archive = tar::Archive::new(bytes.as_slice());
    for entry in archive.entries()? {
        let entry = entry?;
        let path = entry.path()?.to_string_lossy().into_owned();
        if path.contains(".wh.") {
            continue;
        }
        assert_eq!(entry.header().uid()?, 0, "{} not mapped", path);
        assert_eq!(entry.header().gid()?, 0, "{} not mapped", path);
    }

    fx.dir.create("restored", Some("base"))?;
    fx.driver.apply_diff("restored", Some("base"), &mut Cursor::new(bytes))?;
    let restored = fs::metadata(fx.layer("restored/etc/motd"))?;
    assert_eq!((restored.uid(), restored.gid()), (meta.uid(), meta.gid()));
    Ok(())
}

#[test]
fn test_diff_applied_to_parent_copy_reproduces_child() -> Result<()> {
    let fx = Fixture::new()?;
    base_and_child(&fx)?;

    let bytes = fx.diff_bytes("child", Some("base"))?;
    fx.assert_unmounted(&["base", "child"]);

    fx.dir.create("rebuilt", Some("base"))?;
    let size = fx.driver.apply_diff("rebuilt", Some("base"), &mut Cursor::new(bytes))?;
    assert!(size > 0);

    assert_eq!(tree_snapshot(&fx.layer("rebuilt"))?, tree_snapshot(&fx.layer("child"))?);
    assert!(fx.driver.changes("rebuilt", Some("child"))?.is_empty());
    let linked = fs::metadata(fx.layer("rebuilt/etc/motd.hard"))?;
    assert_eq!(linked.ino(), fs::metadata(fx.layer("rebuilt/etc/motd"))?.ino());
    fx.assert_unmounted(&["base", "child", "rebuilt"]);
    Ok(())
}

#[test]
fn test_diff_size_counts_adds_and_modifies() -> Result<()> {
    let fx = Fixture::new()?;
    base_and_child(&fx)?;

    // hostname (10) + motd (7, counted once with its hardlink) + symlink (8)
    let size = fx.driver.diff_size("child", Some("base"))?;
    assert_eq!(size, 10 + 7 + "hostname".len() as u64);
    fx.assert_unmounted(&["base", "child"]);
    Ok(())
}

#[test]
fn test_diff_size_of_base_layer() -> Result<()> {
    let fx = Fixture::new()?;
    base_and_child(&fx)?;

    let size = fx.driver.diff_size("base", None)?;
    assert_eq!(size, (4 + 3 + 10 + 5) as u64);
    Ok(())
}

#[test]
fn test_single_added_file() -> Result<()> {
    let fx = Fixture::new()?;
    fx.dir.create("a", None)?;
    fx.dir.create("b", Some("a"))?;
    fs::write(fx.layer("b/x"), b"hi")?;

    assert_eq!(fx.driver.changes("b", Some("a"))?, vec![Change::new("/x", ChangeKind::Add)]);
    assert_eq!(fx.driver.diff_size("b", Some("a"))?, 2);

    let bytes = fx.diff_bytes("b", Some("a"))?;
    fx.dir.create("c", Some("a"))?;
    fx.driver.apply_diff("c", Some("a"), &mut Cursor::new(bytes))?;
    assert_eq!(fs::read(fx.layer("c/x"))?, b"hi");
    assert!(fx.driver.changes("c", Some("b"))?.is_empty());
    fx.assert_unmounted(&["a", "b", "c"]);
    Ok(())
}

#[test]
fn test_diff_stream_holds_mount_until_closed() -> Result<()> {
    let fx = Fixture::new()?;
    base_and_child(&fx)?;

    let mut stream = fx.driver.diff("child", Some("base"))?;
    assert_eq!(fx.dir.mount_count("child"), 1);
    assert_eq!(fx.dir.mount_count("base"), 0);

    let mut bytes = Vec::new();
    stream.read_to_end(&mut bytes)?;
    assert_eq!(fx.dir.mount_count("child"), 1);

    stream.close()?;
    assert_eq!(fx.dir.mount_count("child"), 0);
    stream.close()?;
    drop(stream);
    assert_eq!(fx.dir.mount_count("child"), 0);
    Ok(())
}

#[test]
fn test_dropped_diff_stream_releases_mount() -> Result<()> {
    let fx = Fixture::new()?;
    base_and_child(&fx)?;

    let stream = fx.driver.diff("child", None)?;
    assert_eq!(fx.dir.mount_count("child"), 1);
    drop(stream);
    fx.assert_unmounted(&["child"]);
    Ok(())
}

#[test]
fn test_failures_leave_nothing_mounted() -> Result<()> {
    let fx = Fixture::new()?;
    base_and_child(&fx)?;

    let err = fx.driver.diff("child", Some("missing")).unwrap_err();
    assert!(matches!(err, GraphDriverError::Mount { ref id, .. } if id == "missing"));
    let err = fx.driver.changes("missing", None).unwrap_err();
    assert!(matches!(err, GraphDriverError::Mount { .. }));
    let err = fx.driver.diff_size("child", Some("missing")).unwrap_err();
    assert!(matches!(err, GraphDriverError::Mount { .. }));

    let err = fx
        .driver
        .apply_diff("child", None, &mut Cursor::new(b"definitely not a tar archive".repeat(40)))
        .unwrap_err();
    assert!(matches!(err, GraphDriverError::Extract(_)));

    fx.assert_unmounted(&["base", "child"]);
    Ok(())
}

#[test]
#[serial]
fn test_parent_diffs_settle_to_next_whole_second() -> Result<()> {
    let fx = Fixture::new()?;
    fx.dir.create("a", None)?;
    fx.dir.create("b", Some("a"))?;
    fs::write(fx.layer("b/x"), b"hi")?;

    let started = SystemTime::now();
    fx.diff_bytes("b", Some("a"))?;
    fx.diff_bytes("b", Some("a"))?;

    let secs = started.duration_since(UNIX_EPOCH)?.as_secs();
    assert!(SystemTime::now() >= UNIX_EPOCH + Duration::from_secs(secs + 1));
    Ok(())
}

#[test]
#[serial]
fn test_full_diff_does_not_wait() -> Result<()> {
    let fx = Fixture::new()?;
    fx.dir.create("a", None)?;

    fs::write(fx.layer("a/file"), b"content")?;

    let mut stream = fx.driver.diff("a", None)?;
    assert!(!stream.settles());
    let mut bytes = Vec::new();
    stream.read_to_end(&mut bytes)?;

    let closing = Instant::now();
    stream.close()?;
    assert!(closing.elapsed() < Duration::from_millis(500));
    assert!(!bytes.is_empty());
    fx.assert_unmounted(&["a"]);
    Ok(())
}
