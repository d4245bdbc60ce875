//! Data directory enumeration and the backup file list.
//!
//! The scanner walks `$PGDATA`, skips runtime-only content, and tags files
//! eligible for page-level copying. The resulting entries are persisted as
//! `file_database.txt` (one NUL-delimited row per entry under a header line
//! declaring the field order) and `mkdirs.sh` (directory and symlink
//! scaffolding the restore side replays before copying files).

use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::backup::pagemap::PageMap;
use crate::catalog::BYTES_INVALID;
use crate::{Error, Result};

pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;

/// Directories whose contents are runtime-only; the directory itself is kept
/// so the restore side recreates it empty.
const EXCLUDED_DIR_CONTENTS: &[&str] = &["pg_xlog", "pg_wal", "pg_stat_tmp", "pg_replslot", "pgsql_tmp"];

/// Files never worth carrying into a backup.
const EXCLUDED_FILES: &[&str] = &[
    "postmaster.pid",
    "postmaster.opts",
    "recovery.conf",
    "recovery.done",
    "pg_internal.init",
];

const FILE_LIST_HEADER: &str = "path\0mode\0size\0mtime\0crc\0write_size\0is_datafile\0";

/// One captured file, directory or symlink, with its path relative to the
/// data directory root.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub path: PathBuf,
    pub mode: u32,
    pub size: i64,
    pub mtime: i64,
    pub crc: Option<u32>,
    pub write_size: i64,
    pub is_datafile: bool,
    /// Symlink target; recreated via the scaffolding script, not serialized
    /// in the file list.
    pub linked: Option<PathBuf>,
    /// Dirty blocks from the WAL scan; live only during one backup run.
    pub pagemap: PageMap,
    /// Bytes read while copying; live only during one backup run.
    pub read_size: i64,
}

impl FileEntry {
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    pub fn is_regular(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }
}

/// Recursively list the data directory, excluding runtime-only content, and
/// tag relation data files. Entries come back sorted by path.
pub fn list_data_directory(root: &Path) -> Result<Vec<FileEntry>> {
    if !root.is_dir() {
        return Err(Error::Environment(format!(
            "data directory \"{}\" does not exist",
            root.display()
        ))
        .into());
    }

    let mut entries = Vec::new();
    let mut walker = WalkDir::new(root).sort_by_file_name().into_iter();
    while let Some(item) = walker.next() {
        let item = item.map_err(|e| Error::Environment(format!("cannot list data directory: {e}")))?;
        if item.path() == root {
            continue;
        }
        let name = item.file_name().to_string_lossy();

        let meta = item.path().symlink_metadata()?;
        let file_type = meta.file_type();

        if file_type.is_dir() && EXCLUDED_DIR_CONTENTS.contains(&name.as_ref()) {
            // keep the directory entry, drop everything under it
            walker.skip_current_dir();
        } else if file_type.is_file() && EXCLUDED_FILES.contains(&name.as_ref()) {
            continue;
        }

        let relative = item
            .path()
            .strip_prefix(root)
            .map_err(|e| Error::Internal(e.to_string()))?
            .to_path_buf();

        let linked = if file_type.is_symlink() {
            Some(fs::read_link(item.path())?)
        } else {
            None
        };

        entries.push(FileEntry {
            is_datafile: file_type.is_file() && is_datafile_path(&relative),
            path: relative,
            mode: meta.mode(),
            size: if file_type.is_file() { meta.len() as i64 } else { 0 },
            mtime: meta.mtime(),
            crc: None,
            write_size: BYTES_INVALID,
            linked,
            pagemap: PageMap::new(),
            read_size: BYTES_INVALID,
        });
    }

    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

/// Relation data files live under base/, global/ or pg_tblspc/ and their
/// basename starts with a decimal digit.
fn is_datafile_path(relative: &Path) -> bool {
    let in_data_tree = relative.starts_with("base")
        || relative.starts_with("global")
        || relative.starts_with("pg_tblspc");
    if !in_data_tree {
        return false;
    }
    relative
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.chars().next())
        .map(|c| c.is_ascii_digit())
        .unwrap_or(false)
}

/// Write the file list; one row per entry, fields NUL-terminated, first line
/// declaring the field order.
pub fn write_file_list(path: &Path, files: &[FileEntry]) -> Result<()> {
    let mut out = String::new();
    out.push_str(FILE_LIST_HEADER);
    out.push('\n');
    for file in files {
        let crc = file.crc.map(|c| format!("{c:08X}")).unwrap_or_default();
        out.push_str(&format!(
            "{}\0{:o}\0{}\0{}\0{}\0{}\0{}\0\n",
            file.path.display(),
            file.mode,
            file.size,
            file.mtime,
            crc,
            file.write_size,
            if file.is_datafile { 't' } else { 'f' },
        ));
    }
    fs::write(path, out)?;
    Ok(())
}

/// Read a file list written by `write_file_list`.
pub fn read_file_list(path: &Path) -> Result<Vec<FileEntry>> {
    let contents = fs::read_to_string(path)
        .map_err(|e| Error::Corruption(format!("cannot read file list \"{}\": {e}", path.display())))?;
    let mut lines = contents.lines();

    match lines.next() {
        Some(header) if header == FILE_LIST_HEADER => {}
        _ => {
            return Err(Error::Corruption(format!(
                "file list \"{}\" has an invalid header",
                path.display()
            ))
            .into())
        }
    }

    let bad = |line: &str| {
        Error::Corruption(format!(
            "invalid file list entry in \"{}\": {line:?}",
            path.display()
        ))
    };

    let mut files = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\0').collect();
        if fields.len() != 8 || !fields[7].is_empty() {
            return Err(bad(line).into());
        }
        let mode = u32::from_str_radix(fields[1], 8).map_err(|_| bad(line))?;
        let size: i64 = fields[2].parse().map_err(|_| bad(line))?;
        let mtime: i64 = fields[3].parse().map_err(|_| bad(line))?;
        let crc = if fields[4].is_empty() {
            None
        } else {
            Some(u32::from_str_radix(fields[4], 16).map_err(|_| bad(line))?)
        };
        let write_size: i64 = fields[5].parse().map_err(|_| bad(line))?;
        let is_datafile = match fields[6] {
            "t" => true,
            "f" => false,
            _ => return Err(bad(line).into()),
        };

        files.push(FileEntry {
            path: PathBuf::from(fields[0]),
            mode,
            size,
            mtime,
            crc,
            write_size,
            is_datafile,
            linked: None,
            pagemap: PageMap::new(),
            read_size: BYTES_INVALID,
        });
    }
    Ok(files)
}

/// A directory-or-symlink action replayed before file copy during restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaffoldAction {
    Dir(PathBuf),
    Link { target: PathBuf, path: PathBuf },
}

/// Write the directory scaffolding script: `mkdir -p` for every directory,
/// `ln -s` for every symlink, all relative to the data directory root.
pub fn write_mkdirs_script(path: &Path, files: &[FileEntry]) -> Result<()> {
    let mut out = String::from("#!/bin/sh\n\n");
    for file in files {
        if file.is_dir() {
            out.push_str(&format!("mkdir -p \"{}\"\n", file.path.display()));
        }
    }
    for file in files {
        if let Some(target) = &file.linked {
            out.push_str(&format!(
                "ln -s \"{}\" \"{}\"\n",
                target.display(),
                file.path.display()
            ));
        }
    }
    fs::write(path, out)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    Ok(())
}

/// Parse a scaffolding script written by `write_mkdirs_script`.
pub fn read_mkdirs_script(path: &Path) -> Result<Vec<ScaffoldAction>> {
    let contents = fs::read_to_string(path)
        .map_err(|e| Error::Corruption(format!("cannot read \"{}\": {e}", path.display())))?;

    let mut actions = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("mkdir -p ") {
            actions.push(ScaffoldAction::Dir(PathBuf::from(rest.trim_matches('"'))));
        } else if let Some(rest) = line.strip_prefix("ln -s ") {
            let parts: Vec<&str> = rest.splitn(2, "\" \"").collect();
            if parts.len() == 2 {
                actions.push(ScaffoldAction::Link {
                    target: PathBuf::from(parts[0].trim_matches('"')),
                    path: PathBuf::from(parts[1].trim_matches('"')),
                });
            }
        }
    }
    Ok(actions)
}
