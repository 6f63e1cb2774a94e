//! End-to-end tests of the task cache against real directories.

use buildstash_cache::packer::packable_outputs;
use buildstash_cache::{
    CacheOutcome, CacheStore, CachingFileStateProvider, ContentHash, ContentsMode, Error,
    FORMAT_VERSION, InputModes, LocalDirectoryStore, OrderMode, OutputPacker, PathMode,
    ProjectFileResolver, SkipCachedExecutor, TarZstOutputPacker, TaskDeclaration, TaskHistory,
    TaskStateProvider,
};
use std::cell::Cell;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn states(root: &Path) -> TaskStateProvider {
    TaskStateProvider::new(
        root,
        FORMAT_VERSION,
        Arc::new(ProjectFileResolver::new(root)),
        Arc::new(CachingFileStateProvider::new()),
    )
}

fn executor(root: &Path, store: &Path) -> SkipCachedExecutor {
    SkipCachedExecutor::new(
        states(root),
        Arc::new(LocalDirectoryStore::new(store)),
        Arc::new(TarZstOutputPacker::new(root, 3)),
    )
    .with_history(TaskHistory::new(store.join("history")))
}

fn generate_task() -> TaskDeclaration {
    let mut task = TaskDeclaration::new(":generate", ContentHash::of_bytes(b"generate v1"));
    task.inputs
        .files("source", ["a.txt"], InputModes::default())
        .unwrap();
    task.outputs.dir("result", "out").unwrap();
    task
}

fn generate(root: &Path) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let input = fs::read_to_string(root.join("a.txt"))?;
    fs::create_dir_all(root.join("out"))?;
    fs::write(root.join("out/result.txt"), format!("R{}", &input[1..]))?;
    Ok(())
}

#[test]
fn miss_store_hit_then_miss_on_change() {
    let project = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    let root = project.path();
    fs::write(root.join("a.txt"), "v1").unwrap();

    let first = executor(root, cache.path()).execute(&generate_task(), || generate(root));
    assert_eq!(first.outcome, CacheOutcome::Stored);
    let k1 = first.cache_key.unwrap();
    let store = LocalDirectoryStore::new(cache.path());
    assert!(store.blob_path(&k1).is_file());

    // fresh executor, as in a new build
    fs::remove_dir_all(root.join("out")).unwrap();
    let ran = Cell::new(false);
    let second = executor(root, cache.path()).execute(&generate_task(), || {
        ran.set(true);
        generate(root)
    });
    assert_eq!(second.outcome, CacheOutcome::Hit);
    assert_eq!(second.cache_key, Some(k1));
    assert!(!ran.get());
    assert_eq!(fs::read_to_string(root.join("out/result.txt")).unwrap(), "R1");

    fs::write(root.join("a.txt"), "v2").unwrap();
    let third = executor(root, cache.path()).execute(&generate_task(), || generate(root));
    assert_eq!(third.outcome, CacheOutcome::Stored);
    assert_ne!(third.cache_key, Some(k1));
    assert_eq!(fs::read_to_string(root.join("out/result.txt")).unwrap(), "R2");
    assert_eq!(third.differences.len(), 1);
    assert!(
        third.differences[0].contains("a.txt' has changed"),
        "{:?}",
        third.differences
    );
}

#[test]
fn packed_outputs_restore_exactly_elsewhere() {
    let source = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    let out = source.path().join("out");
    fs::create_dir_all(out.join("sub/deeper")).unwrap();
    fs::create_dir_all(out.join("empty")).unwrap();
    fs::write(out.join("top.txt"), "top").unwrap();
    fs::write(out.join("sub/deeper/leaf.bin"), [0u8, 1, 2, 255]).unwrap();
    fs::write(source.path().join("report.txt"), "report").unwrap();

    let mut task = TaskDeclaration::new(":build", ContentHash::of_bytes(b"build"));
    task.outputs.dir("classes", "out").unwrap();
    task.outputs.file("report", "report.txt").unwrap();
    task.outputs.file("absent", "absent.txt").unwrap();

    let mut archive = Vec::new();
    let resolver = ProjectFileResolver::new(source.path());
    TarZstOutputPacker::new(source.path(), 3)
        .pack(&packable_outputs(&task, &resolver).unwrap(), &mut archive)
        .unwrap();

    // stale content at the target must not survive
    fs::create_dir_all(target.path().join("out")).unwrap();
    fs::write(target.path().join("out/stale.txt"), "old").unwrap();
    fs::write(target.path().join("absent.txt"), "old").unwrap();

    let resolver = ProjectFileResolver::new(target.path());
    TarZstOutputPacker::new(target.path(), 3)
        .unpack(
            &packable_outputs(&task, &resolver).unwrap(),
            &mut archive.as_slice(),
        )
        .unwrap();

    let restored = target.path().join("out");
    assert_eq!(fs::read_to_string(restored.join("top.txt")).unwrap(), "top");
    assert_eq!(
        fs::read(restored.join("sub/deeper/leaf.bin")).unwrap(),
        vec![0u8, 1, 2, 255]
    );
    assert!(restored.join("empty").is_dir());
    assert!(!restored.join("stale.txt").exists());
    assert_eq!(
        fs::read_to_string(target.path().join("report.txt")).unwrap(),
        "report"
    );
    assert!(!target.path().join("absent.txt").exists());
}

fn two_file_task(paths: [&str; 2], modes: InputModes) -> TaskDeclaration {
    let mut task = TaskDeclaration::new(":concat", ContentHash::of_bytes(b"concat"));
    task.inputs.files("parts", paths, modes).unwrap();
    task.outputs.file("joined", "joined.txt").unwrap();
    task
}

#[test]
fn declared_order_matters_only_when_ordered() {
    let project = TempDir::new().unwrap();
    fs::write(project.path().join("a.txt"), "a").unwrap();
    fs::write(project.path().join("b.txt"), "b").unwrap();
    let key = |paths, modes| {
        states(project.path())
            .capture(&two_file_task(paths, modes))
            .unwrap()
            .cache_key()
            .unwrap()
    };

    let unordered = InputModes::default();
    assert_eq!(
        key(["a.txt", "b.txt"], unordered),
        key(["b.txt", "a.txt"], unordered)
    );

    let ordered = InputModes {
        order: OrderMode::Ordered,
        ..InputModes::default()
    };
    assert_ne!(
        key(["a.txt", "b.txt"], ordered),
        key(["b.txt", "a.txt"], ordered)
    );
}

#[test]
fn relocated_project_keeps_its_key() {
    let first = TempDir::new().unwrap();
    let second = TempDir::new().unwrap();
    for root in [first.path(), second.path()] {
        fs::create_dir_all(root.join("src/pkg")).unwrap();
        fs::write(root.join("src/pkg/Main.java"), "class Main {}").unwrap();
    }
    for path in [PathMode::Absolute, PathMode::HierarchyRelative] {
        let mut task = TaskDeclaration::new(":compile", ContentHash::of_bytes(b"javac"));
        task.inputs
            .files(
                "sources",
                ["src"],
                InputModes {
                    path,
                    ..InputModes::default()
                },
            )
            .unwrap();
        task.outputs.dir("classes", "build/classes").unwrap();
        let a = states(first.path()).capture(&task).unwrap().cache_key().unwrap();
        let b = states(second.path()).capture(&task).unwrap().cache_key().unwrap();
        assert_eq!(a, b, "{path:?}");
    }
}

#[test]
fn ignored_contents_only_track_presence() {
    let project = TempDir::new().unwrap();
    fs::write(project.path().join("a.txt"), "a").unwrap();
    fs::write(project.path().join("b.txt"), "b").unwrap();
    let modes = InputModes {
        contents: ContentsMode::IgnoreContents,
        ..InputModes::default()
    };
    let key = || {
        states(project.path())
            .capture(&two_file_task(["a.txt", "b.txt"], modes))
            .unwrap()
            .cache_key()
            .unwrap()
    };

    let before = key();
    fs::write(project.path().join("a.txt"), "rewritten").unwrap();
    assert_eq!(key(), before);
    fs::remove_file(project.path().join("b.txt")).unwrap();
    assert_ne!(key(), before);
}

#[test]
fn outputs_must_stay_under_the_root() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("project");
    fs::create_dir_all(&root).unwrap();
    let mut task = TaskDeclaration::new(":escape", ContentHash::of_bytes(b"escape"));
    task.outputs.dir("loot", "../elsewhere").unwrap();

    let err = states(&root).capture(&task).unwrap_err();
    assert!(matches!(err, Error::PathOutsideRoot { .. }));
    assert!(err.is_configuration());
}

#[test]
fn repeated_puts_leave_one_blob() {
    let project = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    let root = project.path();
    fs::write(root.join("a.txt"), "v1").unwrap();

    let exec = executor(root, cache.path()).with_history(TaskHistory::new(cache.path().join("h")));
    let key = exec.execute(&generate_task(), || generate(root)).cache_key.unwrap();

    // a second build without hitting the cache, e.g. a forced rerun
    let store = LocalDirectoryStore::new(cache.path());
    let blob = store.get(&key).unwrap().unwrap();
    let bytes = blob.to_vec().unwrap();
    store.put(&key, &blob).unwrap();
    assert_eq!(store.get(&key).unwrap().unwrap().to_vec().unwrap(), bytes);

    let shard = store.blob_path(&key).parent().unwrap().to_path_buf();
    assert_eq!(fs::read_dir(shard).unwrap().count(), 1);
}
