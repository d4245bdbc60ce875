//! CLI contract tests for pg_arman argument validation, diagnostics and the
//! `-c`/`--check` dry-run guarantee.

use std::path::PathBuf;

use chrono::NaiveDateTime;
use pg_arman::backup::filetree::{self, FileEntry};
use pg_arman::backup::pagemap::PageMap;
use pg_arman::catalog::{Backup, BackupMode, BackupStatus, Catalog, BYTES_INVALID};
use pg_arman::wal::{segment_file_name, Lsn, XLOG_SEG_SIZE};
use pg_arman::Error;
use tempfile::tempdir;

fn clean_env() {
    // these vars would silently satisfy required-parameter checks
    for var in ["PGDATA", "BACKUP_PATH", "ARCLOG_PATH"] {
        std::env::remove_var(var);
    }
}

fn run_err(args: &[&str]) -> anyhow::Error {
    clean_env();
    pg_arman::run(args.iter().copied()).expect_err("command should fail")
}

fn expect_usage(args: &[&str], needle: &str) {
    let err = run_err(args);
    let actual = err
        .downcast_ref::<Error>()
        .unwrap_or_else(|| panic!("unexpected error type: {err:?}"));
    assert!(
        matches!(actual, Error::Usage(_)),
        "expected usage error, got {actual:?}"
    );
    assert!(
        err.to_string().contains(needle),
        "message {:?} does not contain {needle:?}",
        err.to_string()
    );
}

#[test]
fn backup_requires_backup_path() {
    let pgdata = tempdir().unwrap();
    let arclog = tempdir().unwrap();
    expect_usage(
        &[
            "pg_arman",
            "backup",
            "-b",
            "full",
            "-D",
            pgdata.path().to_str().unwrap(),
            "-A",
            arclog.path().to_str().unwrap(),
        ],
        "required parameter not specified: BACKUP_PATH (-B, --backup-path)",
    );
}

#[test]
fn backup_requires_backup_mode() {
    let root = tempdir().unwrap();
    let pgdata = tempdir().unwrap();
    let arclog = tempdir().unwrap();
    expect_usage(
        &[
            "pg_arman",
            "backup",
            "-B",
            root.path().to_str().unwrap(),
            "-D",
            pgdata.path().to_str().unwrap(),
            "-A",
            arclog.path().to_str().unwrap(),
        ],
        "Required parameter not specified: BACKUP_MODE (-b, --backup-mode)",
    );
}

#[test]
fn backup_rejects_invalid_mode() {
    let root = tempdir().unwrap();
    expect_usage(
        &[
            "pg_arman",
            "backup",
            "-B",
            root.path().to_str().unwrap(),
            "-b",
            "bad",
        ],
        "invalid backup-mode \"bad\"",
    );
}

#[test]
fn delete_requires_arclog_path() {
    let root = tempdir().unwrap();
    expect_usage(
        &[
            "pg_arman",
            "delete",
            "20200101T000000",
            "-B",
            root.path().to_str().unwrap(),
        ],
        "delete command needs ARCLOG_PATH",
    );
}

#[test]
fn delete_requires_date() {
    let root = tempdir().unwrap();
    let arclog = tempdir().unwrap();
    expect_usage(
        &[
            "pg_arman",
            "delete",
            "-B",
            root.path().to_str().unwrap(),
            "-A",
            arclog.path().to_str().unwrap(),
        ],
        "required delete range option not specified: delete DATE",
    );
}

#[test]
fn ini_rejects_mistyped_integer() {
    let root = tempdir().unwrap();
    std::fs::write(
        root.path().join("pg_arman.ini"),
        "keep-data-generations = TRUE\n",
    )
    .unwrap();

    let err = run_err(&["pg_arman", "show", "-B", root.path().to_str().unwrap()]);
    let actual = err
        .downcast_ref::<Error>()
        .unwrap_or_else(|| panic!("unexpected error type: {err:?}"));
    assert!(matches!(actual, Error::Config(_)));
    assert!(err
        .to_string()
        .contains("should be a 32bit signed integer: 'TRUE'"));
}

#[test]
fn version_renders_product_and_number() {
    let version = pg_arman::cli::clap_command().render_version();
    assert_eq!(version.trim_end(), "pg_arman 0.1");
}

#[test]
fn page_backup_requires_full_parent() {
    let root = tempdir().unwrap();
    let catalog_root = root.path().join("catalog");
    let pgdata = tempdir().unwrap();
    let arclog = tempdir().unwrap();

    clean_env();
    pg_arman::run([
        "pg_arman",
        "init",
        "-B",
        catalog_root.to_str().unwrap(),
    ])
    .expect("init should succeed");

    let err = run_err(&[
        "pg_arman",
        "backup",
        "-b",
        "page",
        "-B",
        catalog_root.to_str().unwrap(),
        "-D",
        pgdata.path().to_str().unwrap(),
        "-A",
        arclog.path().to_str().unwrap(),
    ]);
    assert!(err
        .to_string()
        .contains("Valid full backup not found for differential backup"));
}

#[test]
fn concurrent_invocation_exits_with_contention() {
    let root = tempdir().unwrap();
    let pgdata = tempdir().unwrap();
    let arclog = tempdir().unwrap();
    std::fs::create_dir_all(root.path().join("backup")).unwrap();
    // a live holder: our own pid
    std::fs::write(
        root.path().join("backup.lock"),
        format!("{}\n", std::process::id()),
    )
    .unwrap();

    let err = run_err(&[
        "pg_arman",
        "backup",
        "-b",
        "full",
        "-B",
        root.path().to_str().unwrap(),
        "-D",
        pgdata.path().to_str().unwrap(),
        "-A",
        arclog.path().to_str().unwrap(),
    ]);
    let actual = err
        .downcast_ref::<Error>()
        .unwrap_or_else(|| panic!("unexpected error type: {err:?}"));
    assert!(matches!(actual, Error::CatalogBusy));
    assert!(err
        .to_string()
        .contains("another pg_arman is running, skipping this backup"));
    // the lock file is untouched by the loser
    assert!(root.path().join("backup.lock").exists());
}

#[test]
fn init_refuses_populated_directory() {
    let root = tempdir().unwrap();
    std::fs::write(root.path().join("something"), b"x").unwrap();
    let err = run_err(&["pg_arman", "init", "-B", root.path().to_str().unwrap()]);
    assert!(err.to_string().contains("backup catalog already exist"));
}

fn seed_backup(catalog: &Catalog, start: &str, status: BackupStatus, start_lsn: Lsn) -> Backup {
    let mut backup = Backup::new(
        BackupMode::Full,
        NaiveDateTime::parse_from_str(start, "%Y%m%dT%H%M%S").unwrap(),
    );
    backup.tli = 1;
    backup.start_lsn = start_lsn;
    if status != BackupStatus::Running {
        backup.transition(status).unwrap();
    }
    catalog.create_backup_dir(&backup).unwrap();
    catalog.write_ini(&backup).unwrap();
    backup
}

fn manifest_text(catalog: &Catalog, backup: &Backup) -> String {
    std::fs::read_to_string(catalog.backup_dir(backup).join("backup.ini")).unwrap()
}

#[test]
fn check_mode_init_writes_nothing() {
    let root = tempdir().unwrap();
    let target = root.path().join("catalog");

    clean_env();
    pg_arman::run(["pg_arman", "init", "-c", "-B", target.to_str().unwrap()])
        .expect("dry-run init should succeed");
    assert!(!target.exists());
}

#[test]
fn check_mode_delete_leaves_catalog_and_archive_untouched() {
    let root = tempdir().unwrap();
    let arclog = tempdir().unwrap();
    std::fs::create_dir_all(root.path().join("backup")).unwrap();
    let catalog = Catalog::new(root.path());

    let old = seed_backup(
        &catalog,
        "20260101T000000",
        BackupStatus::Done,
        Lsn(2 * XLOG_SEG_SIZE + 64),
    );
    // a stale RUNNING record a real run would repair
    let stale = seed_backup(
        &catalog,
        "20260110T000000",
        BackupStatus::Running,
        Lsn(2 * XLOG_SEG_SIZE + 128),
    );
    std::fs::write(arclog.path().join(segment_file_name(1, 1)), b"wal").unwrap();

    clean_env();
    pg_arman::run([
        "pg_arman",
        "delete",
        "20260601T000000",
        "-c",
        "-B",
        root.path().to_str().unwrap(),
        "-A",
        arclog.path().to_str().unwrap(),
    ])
    .expect("dry-run delete should succeed");

    // nothing on disk changed: statuses, payloads, archived segments
    assert!(manifest_text(&catalog, &old).contains("STATUS=DONE"));
    assert!(manifest_text(&catalog, &stale).contains("STATUS=RUNNING"));
    assert!(catalog.database_dir(&old).exists());
    assert!(arclog.path().join(segment_file_name(1, 1)).exists());
}

#[test]
fn check_mode_validate_reports_without_marking_corrupt() {
    let root = tempdir().unwrap();
    std::fs::create_dir_all(root.path().join("backup")).unwrap();
    let catalog = Catalog::new(root.path());
    let backup = seed_backup(&catalog, "20260101T000000", BackupStatus::Done, Lsn(64));

    // a captured file whose recorded CRC does not match its bytes
    std::fs::write(catalog.database_dir(&backup).join("afile"), b"data").unwrap();
    let entry = FileEntry {
        path: PathBuf::from("afile"),
        mode: 0o100644,
        size: 4,
        mtime: 0,
        crc: Some(0xDEAD_BEEF),
        write_size: 4,
        is_datafile: false,
        linked: None,
        pagemap: PageMap::new(),
        read_size: BYTES_INVALID,
    };
    filetree::write_file_list(&catalog.file_list_path(&backup), &[entry]).unwrap();

    let err = run_err(&[
        "pg_arman",
        "validate",
        "20260101T000000",
        "-c",
        "-B",
        root.path().to_str().unwrap(),
    ]);
    assert!(err.to_string().contains("corrupt backup(s) found"));
    // the corruption is reported but the record is not flipped on disk
    assert!(manifest_text(&catalog, &backup).contains("STATUS=DONE"));
}
