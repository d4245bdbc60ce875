//! Copying files into a backup, in two shapes: verbatim streams for ordinary
//! files, and delta files holding only the changed pages of a relation
//! segment.
//!
//! A delta file is self-describing: a fixed header records the magic, the
//! page size and the format version, then each changed page follows as
//! `(blockno, page, crc32)` in ascending block order, closed by a
//! terminator block number. Pages absent from the delta are filled from the
//! parent backup by the restorer.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::os::unix::fs::{FileExt, PermissionsExt};
use std::path::Path;

use crate::backup::filetree::FileEntry;
use crate::wal::{Lsn, BLCKSZ};
use crate::{Error, Result};

pub const DELTA_MAGIC: [u8; 4] = *b"ARMD";
pub const DELTA_VERSION: u32 = 1;
pub const DELTA_HEADER_SIZE: usize = 12;
const DELTA_TERMINATOR: u32 = 0xFFFF_FFFF;

const COPY_BUF_SIZE: usize = 64 * 1024;

/// Copy a file byte for byte, recording size, CRC and write size in the
/// entry. Returns false when the file vanished between scan and copy, which
/// is a skip, not an error.
pub fn copy_file(from_root: &Path, to_root: &Path, entry: &mut FileEntry) -> Result<bool> {
    let src_path = from_root.join(&entry.path);
    let dst_path = to_root.join(&entry.path);

    let mut src = match File::open(&src_path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => {
            return Err(Error::Environment(format!(
                "cannot open \"{}\": {e}",
                src_path.display()
            ))
            .into())
        }
    };

    if let Some(parent) = dst_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut dst = BufWriter::new(File::create(&dst_path)?);

    let mut hasher = crc32fast::Hasher::new();
    let mut copied: i64 = 0;
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        dst.write_all(&buf[..n])?;
        copied += n as i64;
    }
    dst.flush()?;
    fs::set_permissions(&dst_path, fs::Permissions::from_mode(entry.mode & 0o7777))?;

    entry.size = copied;
    entry.read_size = copied;
    entry.write_size = copied;
    entry.crc = Some(hasher.finalize());
    Ok(true)
}

/// Copy only the changed pages of a relation segment into a delta file. A
/// page is emitted when its header LSN is at or past the parent backup's
/// start position, or when the WAL scan marked its block in the page map.
/// Returns false when the file vanished between scan and copy.
pub fn backup_data_file(
    from_root: &Path,
    to_root: &Path,
    entry: &mut FileEntry,
    parent_lsn: Lsn,
) -> Result<bool> {
    let src_path = from_root.join(&entry.path);
    let dst_path = to_root.join(&entry.path);

    let mut src = match File::open(&src_path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => {
            return Err(Error::Environment(format!(
                "cannot open \"{}\": {e}",
                src_path.display()
            ))
            .into())
        }
    };

    if let Some(parent) = dst_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut dst = BufWriter::new(File::create(&dst_path)?);

    let mut header = Vec::with_capacity(DELTA_HEADER_SIZE);
    header.extend_from_slice(&DELTA_MAGIC);
    header.extend_from_slice(&(BLCKSZ as u32).to_le_bytes());
    header.extend_from_slice(&DELTA_VERSION.to_le_bytes());
    dst.write_all(&header)?;

    let mut read_size: i64 = 0;
    let mut write_size: i64 = DELTA_HEADER_SIZE as i64;
    let mut page = vec![0u8; BLCKSZ];
    let mut blkno: u32 = 0;
    loop {
        let n = read_full(&mut src, &mut page)?;
        if n == 0 {
            break;
        }
        read_size += n as i64;
        if n < BLCKSZ {
            // partial tail page; zero-fill, the true length is kept in the
            // entry's size and restored via truncation
            page[n..].fill(0);
        }

        if page_lsn(&page) >= parent_lsn || entry.pagemap.contains(blkno) {
            dst.write_all(&blkno.to_le_bytes())?;
            dst.write_all(&page)?;
            dst.write_all(&crc32fast::hash(&page).to_le_bytes())?;
            write_size += 4 + BLCKSZ as i64 + 4;
        }
        blkno += 1;
    }
    dst.write_all(&DELTA_TERMINATOR.to_le_bytes())?;
    write_size += 4;
    dst.flush()?;
    fs::set_permissions(&dst_path, fs::Permissions::from_mode(entry.mode & 0o7777))?;

    entry.size = read_size;
    entry.read_size = read_size;
    entry.write_size = write_size;
    entry.crc = None;
    Ok(true)
}

/// Apply a delta file onto a target file that already holds the parent's
/// image, then cut it to the recorded size.
pub fn restore_data_file(delta_path: &Path, target_path: &Path, file_size: i64) -> Result<()> {
    let data = fs::read(delta_path)?;
    let mut reader = DeltaReader::open(delta_path, &data)?;

    if let Some(parent) = target_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let target = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(target_path)?;

    while let Some((blkno, page)) = reader.next_block()? {
        target.write_all_at(page, blkno as u64 * BLCKSZ as u64)?;
    }
    target.set_len(file_size.max(0) as u64)?;
    Ok(())
}

/// Verify a delta file's header, per-page checksums and terminator without
/// applying it.
pub fn validate_delta_file(delta_path: &Path) -> Result<()> {
    let data = fs::read(delta_path)?;
    let mut reader = DeltaReader::open(delta_path, &data)?;
    while reader.next_block()?.is_some() {}
    Ok(())
}

struct DeltaReader<'a> {
    path: &'a Path,
    data: &'a [u8],
    ofs: usize,
    prev_blkno: Option<u32>,
    done: bool,
}

impl<'a> DeltaReader<'a> {
    fn open(path: &'a Path, data: &'a [u8]) -> Result<Self> {
        let bad = |reason: &str| {
            Error::Corruption(format!("invalid delta file \"{}\": {reason}", path.display()))
        };
        if data.len() < DELTA_HEADER_SIZE {
            return Err(bad("short header").into());
        }
        if data[0..4] != DELTA_MAGIC {
            return Err(bad("bad magic").into());
        }
        let blcksz = u32::from_le_bytes(data[4..8].try_into().unwrap());
        if blcksz as usize != BLCKSZ {
            return Err(bad(&format!("page size {blcksz} != {BLCKSZ}")).into());
        }
        let version = u32::from_le_bytes(data[8..12].try_into().unwrap());
        if version != DELTA_VERSION {
            return Err(bad(&format!("unsupported version {version}")).into());
        }
        Ok(DeltaReader {
            path,
            data,
            ofs: DELTA_HEADER_SIZE,
            prev_blkno: None,
            done: false,
        })
    }

    fn next_block(&mut self) -> Result<Option<(u32, &'a [u8])>> {
        let bad = |reason: String| {
            Error::Corruption(format!(
                "invalid delta file \"{}\": {reason}",
                self.path.display()
            ))
        };
        if self.done {
            return Ok(None);
        }
        if self.data.len() < self.ofs + 4 {
            return Err(bad("missing terminator".into()).into());
        }
        let blkno = u32::from_le_bytes(self.data[self.ofs..self.ofs + 4].try_into().unwrap());
        self.ofs += 4;
        if blkno == DELTA_TERMINATOR {
            if self.ofs != self.data.len() {
                return Err(bad("trailing bytes after terminator".into()).into());
            }
            self.done = true;
            return Ok(None);
        }
        if let Some(prev) = self.prev_blkno {
            if blkno <= prev {
                return Err(bad(format!("block {blkno} out of order")).into());
            }
        }
        self.prev_blkno = Some(blkno);

        if self.data.len() < self.ofs + BLCKSZ + 4 {
            return Err(bad(format!("truncated page for block {blkno}")).into());
        }
        let page = &self.data[self.ofs..self.ofs + BLCKSZ];
        self.ofs += BLCKSZ;
        let stored = u32::from_le_bytes(self.data[self.ofs..self.ofs + 4].try_into().unwrap());
        self.ofs += 4;
        let computed = crc32fast::hash(page);
        if stored != computed {
            return Err(bad(format!(
                "checksum mismatch for block {blkno}: expected {stored:08X}, computed {computed:08X}"
            ))
            .into());
        }
        Ok(Some((blkno, page)))
    }
}

/// The LSN stamped into a data page header: two 32-bit halves, high first.
fn page_lsn(page: &[u8]) -> Lsn {
    let hi = u32::from_le_bytes(page[0..4].try_into().unwrap());
    let lo = u32::from_le_bytes(page[4..8].try_into().unwrap());
    Lsn(((hi as u64) << 32) | lo as u64)
}

fn read_full(src: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = src.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
