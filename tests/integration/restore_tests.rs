//! End-to-end catalog flows without a live server: captured full and
//! differential backups are replayed into a fresh data directory, and the
//! delete command's marking and WAL pruning are exercised.

use std::fs;
use std::path::Path;

use chrono::NaiveDateTime;
use pg_arman::backup::{datafile, filetree};
use pg_arman::catalog::{Backup, BackupMode, BackupStatus, Catalog, BYTES_INVALID};
use pg_arman::options::Options;
use pg_arman::wal::{segment_file_name, Lsn, BLCKSZ, XLOG_SEG_SIZE};
use tempfile::tempdir;

fn time(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
}

fn page(lsn: Lsn, fill: u8) -> Vec<u8> {
    let mut page = vec![fill; BLCKSZ];
    page[0..4].copy_from_slice(&((lsn.0 >> 32) as u32).to_le_bytes());
    page[4..8].copy_from_slice(&(lsn.0 as u32).to_le_bytes());
    page
}

fn write_cluster_file(root: &Path, rel: &str, contents: &[u8]) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

/// Capture a FULL backup of `cluster` the way the orchestrator would,
/// without needing a server.
fn capture_full(catalog: &Catalog, cluster: &Path, start: &str, start_lsn: Lsn) -> Backup {
    let mut backup = Backup::new(BackupMode::Full, time(start));
    backup.tli = 1;
    backup.start_lsn = start_lsn;
    backup.stop_lsn = Lsn(start_lsn.0 + 0x100);
    backup.block_size = 8192;
    backup.wal_block_size = 8192;
    catalog.create_backup_dir(&backup).unwrap();

    let mut files = filetree::list_data_directory(cluster).unwrap();
    filetree::write_mkdirs_script(&catalog.mkdirs_path(&backup), &files).unwrap();
    let dbdir = catalog.database_dir(&backup);
    for file in &mut files {
        if file.is_dir() {
            fs::create_dir_all(dbdir.join(&file.path)).unwrap();
        } else if file.is_regular() {
            assert!(datafile::copy_file(cluster, &dbdir, file).unwrap());
        }
    }
    filetree::write_file_list(&catalog.file_list_path(&backup), &files).unwrap();

    backup.recovery_time = Some(time(start));
    backup.end_time = Some(time(start));
    backup.transition(BackupStatus::Done).unwrap();
    catalog.write_ini(&backup).unwrap();
    backup
}

/// Capture a DIFF_PAGE backup against `parent`: datafiles known to the
/// parent become page deltas, `skipped` paths are recorded as unchanged,
/// everything else is copied verbatim.
fn capture_page(
    catalog: &Catalog,
    cluster: &Path,
    parent: &Backup,
    start: &str,
    skipped: &[&str],
) -> Backup {
    let mut backup = Backup::new(BackupMode::Page, time(start));
    backup.tli = 1;
    backup.start_lsn = Lsn(parent.start_lsn.0 + 0x1000);
    backup.stop_lsn = Lsn(backup.start_lsn.0 + 0x100);
    backup.block_size = 8192;
    backup.wal_block_size = 8192;
    catalog.create_backup_dir(&backup).unwrap();

    let prev_files = filetree::read_file_list(&catalog.file_list_path(parent)).unwrap();
    let in_prev = |p: &Path| prev_files.iter().any(|f| f.path == p);

    let mut files = filetree::list_data_directory(cluster).unwrap();
    filetree::write_mkdirs_script(&catalog.mkdirs_path(&backup), &files).unwrap();
    let dbdir = catalog.database_dir(&backup);
    for file in &mut files {
        if file.is_dir() {
            fs::create_dir_all(dbdir.join(&file.path)).unwrap();
            continue;
        }
        if !file.is_regular() {
            continue;
        }
        if skipped.iter().any(|s| file.path == Path::new(s)) {
            file.write_size = BYTES_INVALID;
            continue;
        }
        if file.is_datafile && in_prev(&file.path) {
            assert!(
                datafile::backup_data_file(cluster, &dbdir, file, parent.start_lsn).unwrap()
            );
        } else {
            assert!(datafile::copy_file(cluster, &dbdir, file).unwrap());
        }
    }
    filetree::write_file_list(&catalog.file_list_path(&backup), &files).unwrap();

    backup.recovery_time = Some(time(start));
    backup.end_time = Some(time(start));
    backup.transition(BackupStatus::Done).unwrap();
    catalog.write_ini(&backup).unwrap();
    backup
}

struct Scenario {
    _root: tempfile::TempDir,
    catalog_root: std::path::PathBuf,
    arclog: std::path::PathBuf,
    modified_datafile: Vec<u8>,
}

/// One full backup, then a differential after page 0 was rewritten, page 2
/// appended and pg_hba.conf replaced; PG_VERSION is recorded as unchanged.
fn build_scenario() -> Scenario {
    let root = tempdir().unwrap();
    let cluster = root.path().join("cluster");
    let catalog_root = root.path().join("catalog");
    let arclog = root.path().join("arclog");
    fs::create_dir_all(&arclog).unwrap();
    fs::create_dir_all(catalog_root.join("backup")).unwrap();
    let catalog = Catalog::new(&catalog_root);

    let full_lsn = Lsn(0x1000);
    let mut original = Vec::new();
    original.extend(page(Lsn(0x100), 0x11));
    original.extend(page(Lsn(0x200), 0x22));

    write_cluster_file(&cluster, "PG_VERSION", b"9.6\n");
    write_cluster_file(&cluster, "pg_hba.conf", b"hba v1\n");
    write_cluster_file(&cluster, "base/5/16384", &original);
    fs::create_dir_all(cluster.join("pg_xlog")).unwrap();

    let full = capture_full(&catalog, &cluster, "2026-01-01 00:00:00", full_lsn);

    let mut modified = Vec::new();
    modified.extend(page(Lsn(0x2000), 0x99));
    modified.extend(page(Lsn(0x200), 0x22));
    modified.extend(page(Lsn(0x2500), 0x44));
    write_cluster_file(&cluster, "base/5/16384", &modified);
    write_cluster_file(&cluster, "pg_hba.conf", b"hba v2\n");

    capture_page(
        &catalog,
        &cluster,
        &full,
        "2026-01-02 00:00:00",
        &["PG_VERSION"],
    );

    Scenario {
        _root: root,
        catalog_root,
        arclog,
        modified_datafile: modified,
    }
}

#[test]
fn restore_rebuilds_full_plus_differential() {
    let scenario = build_scenario();
    let pgdata = tempdir().unwrap();

    let mut opts = Options::default();
    opts.pgdata = Some(pgdata.path().to_path_buf());
    opts.backup_path = Some(scenario.catalog_root.clone());
    opts.arclog_path = Some(scenario.arclog.clone());
    pg_arman::restore::do_restore(&opts).unwrap();

    // relation rebuilt from the parent image plus the delta
    assert_eq!(
        fs::read(pgdata.path().join("base/5/16384")).unwrap(),
        scenario.modified_datafile
    );
    // verbatim file from the differential
    assert_eq!(fs::read(pgdata.path().join("pg_hba.conf")).unwrap(), b"hba v2\n");
    // skipped file comes from the parent
    assert_eq!(fs::read(pgdata.path().join("PG_VERSION")).unwrap(), b"9.6\n");
    // scaffolded directory
    assert!(pgdata.path().join("pg_xlog").is_dir());

    let recovery = fs::read_to_string(pgdata.path().join("recovery.conf")).unwrap();
    assert!(recovery.contains(&format!(
        "restore_command = 'cp {}/%f \"%p\"'",
        scenario.arclog.display()
    )));
}

#[test]
fn restore_honors_recovery_targets() {
    let scenario = build_scenario();
    let pgdata = tempdir().unwrap();

    let mut opts = Options::default();
    opts.pgdata = Some(pgdata.path().to_path_buf());
    opts.backup_path = Some(scenario.catalog_root.clone());
    opts.arclog_path = Some(scenario.arclog.clone());
    opts.recovery_target_time = Some("2026-01-05 00:00:00".to_string());
    opts.recovery_target_xid = Some("777".to_string());
    opts.recovery_target_inclusive = Some(true);
    opts.recovery_target_timeline = Some(1);
    pg_arman::restore::do_restore(&opts).unwrap();

    let recovery = fs::read_to_string(pgdata.path().join("recovery.conf")).unwrap();
    assert!(recovery.contains("recovery_target_time = '2026-01-05 00:00:00'"));
    assert!(recovery.contains("recovery_target_xid = '777'"));
    assert!(recovery.contains("recovery_target_inclusive = true"));
    assert!(recovery.contains("recovery_target_timeline = '1'"));
}

#[test]
fn restore_before_differential_uses_only_the_full() {
    let scenario = build_scenario();
    let pgdata = tempdir().unwrap();

    let mut opts = Options::default();
    opts.pgdata = Some(pgdata.path().to_path_buf());
    opts.backup_path = Some(scenario.catalog_root.clone());
    opts.arclog_path = Some(scenario.arclog.clone());
    // between the full and the differential
    opts.recovery_target_time = Some("2026-01-01 12:00:00".to_string());
    pg_arman::restore::do_restore(&opts).unwrap();

    assert_eq!(fs::read(pgdata.path().join("pg_hba.conf")).unwrap(), b"hba v1\n");
}

#[test]
fn check_mode_restore_writes_nothing() {
    let scenario = build_scenario();
    let pgdata = tempdir().unwrap();

    let mut opts = Options::default();
    opts.pgdata = Some(pgdata.path().to_path_buf());
    opts.backup_path = Some(scenario.catalog_root.clone());
    opts.arclog_path = Some(scenario.arclog.clone());
    opts.check = true;
    pg_arman::restore::do_restore(&opts).unwrap();

    // the plan is resolved and logged, the data directory stays empty
    assert!(fs::read_dir(pgdata.path()).unwrap().next().is_none());
}

#[test]
fn restore_refuses_running_cluster() {
    let scenario = build_scenario();
    let pgdata = tempdir().unwrap();
    fs::write(pgdata.path().join("postmaster.pid"), b"1234\n").unwrap();

    let mut opts = Options::default();
    opts.pgdata = Some(pgdata.path().to_path_buf());
    opts.backup_path = Some(scenario.catalog_root.clone());
    opts.arclog_path = Some(scenario.arclog.clone());
    let err = pg_arman::restore::do_restore(&opts).unwrap_err();
    assert!(err.to_string().contains("postmaster.pid"));
}

#[test]
fn delete_marks_old_backups_and_prunes_wal() {
    let root = tempdir().unwrap();
    let cluster = root.path().join("cluster");
    let catalog_root = root.path().join("catalog");
    let arclog = root.path().join("arclog");
    fs::create_dir_all(&arclog).unwrap();
    fs::create_dir_all(catalog_root.join("backup")).unwrap();
    let catalog = Catalog::new(&catalog_root);

    write_cluster_file(&cluster, "PG_VERSION", b"9.6\n");
    let old = capture_full(&catalog, &cluster, "2026-01-01 00:00:00", Lsn(XLOG_SEG_SIZE + 64));
    let new = capture_full(
        &catalog,
        &cluster,
        "2026-02-01 00:00:00",
        Lsn(3 * XLOG_SEG_SIZE + 64),
    );

    for segno in 1..=3u64 {
        fs::write(arclog.join(segment_file_name(1, segno)), b"wal").unwrap();
    }
    fs::write(arclog.join("00000002.history"), b"history").unwrap();

    for var in ["PGDATA", "BACKUP_PATH", "ARCLOG_PATH"] {
        std::env::remove_var(var);
    }
    pg_arman::run([
        "pg_arman",
        "delete",
        "20260115T000000",
        "-B",
        catalog_root.to_str().unwrap(),
        "-A",
        arclog.to_str().unwrap(),
    ])
    .unwrap();

    let list = catalog.list(false).unwrap();
    let status = |b: &Backup| list.iter().find(|x| x.start_time == b.start_time).unwrap().status;
    assert_eq!(status(&old), BackupStatus::Deleted);
    assert_eq!(status(&new), BackupStatus::Done);

    // payload gone, manifest retained
    assert!(!catalog.database_dir(&old).exists());
    assert!(catalog.backup_dir(&old).join("backup.ini").exists());

    // segments older than the remaining backup's start are pruned
    assert!(!arclog.join(segment_file_name(1, 1)).exists());
    assert!(!arclog.join(segment_file_name(1, 2)).exists());
    assert!(arclog.join(segment_file_name(1, 3)).exists());
    assert!(arclog.join("00000002.history").exists());
}
