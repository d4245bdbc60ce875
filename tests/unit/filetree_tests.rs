//! Data-directory scanning and file-list round trips.

use std::fs;
use std::path::{Path, PathBuf};

use pg_arman::backup::filetree::{
    list_data_directory, read_file_list, read_mkdirs_script, write_file_list,
    write_mkdirs_script, FileEntry, ScaffoldAction,
};
use pg_arman::catalog::BYTES_INVALID;
use tempfile::tempdir;

fn touch(path: &Path, contents: &[u8]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

fn build_pgdata(root: &Path) {
    touch(&root.join("PG_VERSION"), b"9.6\n");
    touch(&root.join("pg_hba.conf"), b"local all all trust\n");
    touch(&root.join("postmaster.pid"), b"1234\n");
    touch(&root.join("postmaster.opts"), b"postgres\n");
    touch(&root.join("base/5/16384"), &[0u8; 16]);
    touch(&root.join("base/5/16384_fsm"), &[0u8; 16]);
    touch(&root.join("base/5/16384.1"), &[0u8; 16]);
    touch(&root.join("base/5/PG_VERSION"), b"9.6\n");
    touch(&root.join("global/1262"), &[0u8; 16]);
    touch(&root.join("pg_xlog/000000010000000000000001"), &[0u8; 32]);
    touch(&root.join("pg_xlog/archive_status/000000010000000000000001.ready"), b"");
    touch(&root.join("pg_stat_tmp/global.stat"), b"stats");
    fs::create_dir_all(root.join("pg_tblspc")).unwrap();
    std::os::unix::fs::symlink("/tmp/ts1", root.join("pg_tblspc/16390")).unwrap();
}

fn by_path<'a>(entries: &'a [FileEntry], path: &str) -> Option<&'a FileEntry> {
    entries.iter().find(|e| e.path == PathBuf::from(path))
}

#[test]
fn scanner_tags_and_excludes() {
    let dir = tempdir().unwrap();
    build_pgdata(dir.path());
    let entries = list_data_directory(dir.path()).unwrap();

    // relation files under base/ and global/ with digit-leading names
    assert!(by_path(&entries, "base/5/16384").unwrap().is_datafile);
    assert!(by_path(&entries, "base/5/16384_fsm").unwrap().is_datafile);
    assert!(by_path(&entries, "base/5/16384.1").unwrap().is_datafile);
    assert!(by_path(&entries, "global/1262").unwrap().is_datafile);

    // configuration and version files are kept verbatim
    assert!(!by_path(&entries, "PG_VERSION").unwrap().is_datafile);
    assert!(!by_path(&entries, "pg_hba.conf").unwrap().is_datafile);
    assert!(!by_path(&entries, "base/5/PG_VERSION").unwrap().is_datafile);

    // runtime-only content is dropped, the directories themselves survive
    assert!(by_path(&entries, "pg_xlog").unwrap().is_dir());
    assert!(by_path(&entries, "pg_xlog/000000010000000000000001").is_none());
    assert!(by_path(&entries, "pg_stat_tmp").unwrap().is_dir());
    assert!(by_path(&entries, "pg_stat_tmp/global.stat").is_none());
    assert!(by_path(&entries, "postmaster.pid").is_none());
    assert!(by_path(&entries, "postmaster.opts").is_none());

    // symlinks are emitted with their target
    let link = by_path(&entries, "pg_tblspc/16390").unwrap();
    assert!(link.is_symlink());
    assert_eq!(link.linked.as_deref(), Some(Path::new("/tmp/ts1")));

    // sorted by path
    let paths: Vec<&PathBuf> = entries.iter().map(|e| &e.path).collect();
    let mut sorted = paths.clone();
    sorted.sort();
    assert_eq!(paths, sorted);
}

#[test]
fn file_list_round_trip_preserves_all_fields() {
    let dir = tempdir().unwrap();
    build_pgdata(dir.path());
    let mut entries = list_data_directory(dir.path()).unwrap();

    // simulate a copy pass
    for (i, entry) in entries.iter_mut().enumerate() {
        if entry.is_regular() {
            entry.crc = Some(0xDEAD_0000 + i as u32);
            entry.write_size = entry.size;
        }
    }
    entries[0].write_size = BYTES_INVALID;

    let list_path = dir.path().join("file_database.txt");
    write_file_list(&list_path, &entries).unwrap();
    let read = read_file_list(&list_path).unwrap();

    assert_eq!(read.len(), entries.len());
    for (a, b) in entries.iter().zip(&read) {
        assert_eq!(a.path, b.path);
        assert_eq!(a.mode, b.mode);
        assert_eq!(a.size, b.size);
        assert_eq!(a.mtime, b.mtime);
        assert_eq!(a.crc, b.crc);
        assert_eq!(a.write_size, b.write_size);
        assert_eq!(a.is_datafile, b.is_datafile);
    }
}

#[test]
fn file_list_rejects_foreign_header() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("file_database.txt");
    fs::write(&path, "something else\n").unwrap();
    assert!(read_file_list(&path).is_err());
}

#[test]
fn mkdirs_script_round_trip() {
    let dir = tempdir().unwrap();
    build_pgdata(dir.path());
    let entries = list_data_directory(dir.path()).unwrap();

    let script = dir.path().join("mkdirs.sh");
    write_mkdirs_script(&script, &entries).unwrap();
    let actions = read_mkdirs_script(&script).unwrap();

    assert!(actions.contains(&ScaffoldAction::Dir(PathBuf::from("base/5"))));
    assert!(actions.contains(&ScaffoldAction::Dir(PathBuf::from("pg_xlog"))));
    assert!(actions.contains(&ScaffoldAction::Link {
        target: PathBuf::from("/tmp/ts1"),
        path: PathBuf::from("pg_tblspc/16390"),
    }));
    // no file entries leak into the scaffold
    assert!(!actions
        .iter()
        .any(|a| matches!(a, ScaffoldAction::Dir(p) if p == &PathBuf::from("PG_VERSION"))));
}
