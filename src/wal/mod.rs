//! Reader for archived write-ahead log segments.
//!
//! Walks every record between two log positions and reports each block a
//! record dirties, so a differential backup knows exactly which pages to
//! copy. Understands the physical segment layout (page headers, record
//! continuation across pages and segments), validates per-record CRCs and
//! decodes the block references carried in record headers.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::{Error, Result};

/// WAL segment size in bytes.
pub const XLOG_SEG_SIZE: u64 = 16 * 1024 * 1024;
/// WAL page size in bytes.
pub const XLOG_BLCKSZ: u64 = 8192;
/// Data page size in bytes.
pub const BLCKSZ: usize = 8192;
/// Blocks per relation segment file.
pub const RELSEG_SIZE: u32 = 131072;

pub const DEFAULTTABLESPACE_OID: u32 = 1663;
pub const GLOBALTABLESPACE_OID: u32 = 1664;
pub const TABLESPACE_VERSION_DIRECTORY: &str = "PG_9.6_201608131";

const XLOG_PAGE_MAGIC: u16 = 0xD093;
const XLP_FIRST_IS_CONTRECORD: u16 = 0x0001;
const SIZE_OF_SHORT_PAGE_HEADER: u64 = 24;
const SIZE_OF_LONG_PAGE_HEADER: u64 = 40;
const SIZE_OF_XLOG_RECORD: usize = 24;
const MAX_ALIGN: u64 = 8;

const XLR_MAX_BLOCK_ID: u8 = 32;
const XLR_BLOCK_ID_DATA_SHORT: u8 = 255;
const XLR_BLOCK_ID_DATA_LONG: u8 = 254;
const XLR_BLOCK_ID_ORIGIN: u8 = 253;

const BKPBLOCK_FORK_MASK: u8 = 0x0F;
const BKPBLOCK_HAS_IMAGE: u8 = 0x10;
const BKPBLOCK_HAS_DATA: u8 = 0x20;
const BKPBLOCK_SAME_REL: u8 = 0x80;

const BKPIMAGE_HAS_HOLE: u8 = 0x01;
const BKPIMAGE_IS_COMPRESSED: u8 = 0x02;

const RM_XLOG_ID: u8 = 0;
const RM_SMGR_ID: u8 = 2;
const XLOG_SWITCH: u8 = 0x40;
const XLOG_SMGR_TRUNCATE: u8 = 0x20;
const SMGR_TRUNCATE_HEAP: u32 = 0x0001;

/// A position in the write-ahead log stream, printed as two hex halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const INVALID: Lsn = Lsn(0);

    pub fn parse(value: &str) -> Result<Self> {
        let parse = || -> Option<u64> {
            let (hi, lo) = value.split_once('/')?;
            let hi = u32::from_str_radix(hi.trim(), 16).ok()?;
            let lo = u32::from_str_radix(lo.trim(), 16).ok()?;
            Some(((hi as u64) << 32) | lo as u64)
        };
        parse()
            .map(Lsn)
            .ok_or_else(|| Error::Corruption(format!("invalid log sequence number \"{value}\"")).into())
    }

    /// The segment that contains this position.
    pub fn segment(self) -> u64 {
        self.0 / XLOG_SEG_SIZE
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 as u32)
    }
}

/// Physical identity of a relation: tablespace, database and relation oids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelFileNode {
    pub spcnode: u32,
    pub dbnode: u32,
    pub relnode: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForkNumber {
    Main,
    FreeSpace,
    VisibilityMap,
    Init,
}

impl ForkNumber {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ForkNumber::Main),
            1 => Ok(ForkNumber::FreeSpace),
            2 => Ok(ForkNumber::VisibilityMap),
            3 => Ok(ForkNumber::Init),
            _ => Err(Error::Corruption(format!("invalid fork number {value}")).into()),
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            ForkNumber::Main => "",
            ForkNumber::FreeSpace => "_fsm",
            ForkNumber::VisibilityMap => "_vm",
            ForkNumber::Init => "_init",
        }
    }
}

/// Relative path of a relation fork under the data directory, without a
/// segment suffix.
pub fn relation_path(rnode: RelFileNode, fork: ForkNumber) -> PathBuf {
    let suffix = fork.suffix();
    match rnode.spcnode {
        GLOBALTABLESPACE_OID => PathBuf::from(format!("global/{}{}", rnode.relnode, suffix)),
        DEFAULTTABLESPACE_OID => PathBuf::from(format!(
            "base/{}/{}{}",
            rnode.dbnode, rnode.relnode, suffix
        )),
        spc => PathBuf::from(format!(
            "pg_tblspc/{}/{}/{}/{}{}",
            spc, TABLESPACE_VERSION_DIRECTORY, rnode.dbnode, rnode.relnode, suffix
        )),
    }
}

/// Relative path of one relation segment file (`.N` suffix for N > 0).
pub fn relation_segment_path(rnode: RelFileNode, fork: ForkNumber, segno: u32) -> PathBuf {
    let base = relation_path(rnode, fork);
    if segno == 0 {
        base
    } else {
        let mut name = base.into_os_string();
        name.push(format!(".{segno}"));
        PathBuf::from(name)
    }
}

/// File name of a WAL segment, as the server's archiver writes it.
pub fn segment_file_name(tli: u32, segno: u64) -> String {
    let segments_per_xlog_id = 0x1_0000_0000 / XLOG_SEG_SIZE;
    format!(
        "{:08X}{:08X}{:08X}",
        tli,
        segno / segments_per_xlog_id,
        segno % segments_per_xlog_id
    )
}

/// Receives one call per block dirtied by a WAL record. Duplicates are
/// allowed; the receiver deduplicates.
pub trait BlockChangeSink {
    fn process_block_change(&mut self, fork: ForkNumber, rnode: RelFileNode, blkno: u32);
}

/// Scan archived WAL on `tli` and report every dirtied block of every record
/// whose start position lies in `[from, to)`.
pub fn extract_page_map(
    arclog: &Path,
    from: Lsn,
    tli: u32,
    to: Lsn,
    sink: &mut dyn BlockChangeSink,
) -> Result<()> {
    info!(from = %from, to = %to, tli, "scanning WAL segments for changed blocks");

    let mut reader = WalReader::new(arclog, tli);
    let mut pos = from.0;
    loop {
        if crate::interrupted() {
            return Err(Error::Interrupted("WAL scan").into());
        }
        if pos >= to.0 {
            break;
        }
        pos = reader.align_record_start(pos)?;
        if pos >= to.0 {
            break;
        }

        let (record, end) = reader.read_record(pos)?;
        let is_switch = decode_record(&record, Lsn(pos), sink)?;
        pos = if is_switch { next_segment_start(end) } else { end };
    }

    debug!("WAL scan complete");
    Ok(())
}

fn next_segment_start(pos: u64) -> u64 {
    if pos % XLOG_SEG_SIZE == 0 {
        pos
    } else {
        (pos / XLOG_SEG_SIZE + 1) * XLOG_SEG_SIZE
    }
}

struct PageHeader {
    info: u16,
    rem_len: u32,
    size: u64,
}

struct WalReader {
    arclog: PathBuf,
    tli: u32,
    segno: Option<u64>,
    data: Vec<u8>,
}

impl WalReader {
    fn new(arclog: &Path, tli: u32) -> Self {
        WalReader {
            arclog: arclog.to_path_buf(),
            tli,
            segno: None,
            data: Vec::new(),
        }
    }

    fn load_segment(&mut self, segno: u64) -> Result<()> {
        if self.segno == Some(segno) {
            return Ok(());
        }
        let name = segment_file_name(self.tli, segno);
        let path = self.arclog.join(&name);
        let data = fs::read(&path).map_err(|e| {
            Error::Environment(format!(
                "could not open WAL segment \"{}\": {e}",
                path.display()
            ))
        })?;
        if data.len() as u64 != XLOG_SEG_SIZE {
            return Err(Error::Corruption(format!(
                "WAL segment \"{name}\" has invalid size {}",
                data.len()
            ))
            .into());
        }
        debug!(segment = %name, "reading WAL segment");
        self.segno = Some(segno);
        self.data = data;
        Ok(())
    }

    /// Bytes at an absolute stream position; the span never crosses a page
    /// (and therefore never a segment).
    fn bytes(&mut self, pos: u64, len: usize) -> Result<&[u8]> {
        self.load_segment(pos / XLOG_SEG_SIZE)?;
        let off = (pos % XLOG_SEG_SIZE) as usize;
        Ok(&self.data[off..off + len])
    }

    /// Parse and validate the page header at a page-aligned position.
    fn page_header(&mut self, pos: u64) -> Result<PageHeader> {
        let size = if pos % XLOG_SEG_SIZE == 0 {
            SIZE_OF_LONG_PAGE_HEADER
        } else {
            SIZE_OF_SHORT_PAGE_HEADER
        };
        let raw = self.bytes(pos, SIZE_OF_SHORT_PAGE_HEADER as usize)?;

        let magic = u16::from_le_bytes([raw[0], raw[1]]);
        let info = u16::from_le_bytes([raw[2], raw[3]]);
        let tli = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
        let pageaddr = u64::from_le_bytes(raw[8..16].try_into().unwrap());
        let rem_len = u32::from_le_bytes(raw[16..20].try_into().unwrap());

        if magic != XLOG_PAGE_MAGIC {
            return Err(Error::Corruption(format!(
                "invalid magic number {magic:04X} in WAL page at {}",
                Lsn(pos)
            ))
            .into());
        }
        if tli != self.tli {
            return Err(Error::Corruption(format!(
                "unexpected timeline {tli} in WAL page at {}",
                Lsn(pos)
            ))
            .into());
        }
        if pageaddr != pos {
            return Err(Error::Corruption(format!(
                "unexpected page address {} in WAL page at {}",
                Lsn(pageaddr),
                Lsn(pos)
            ))
            .into());
        }

        Ok(PageHeader {
            info,
            rem_len,
            size,
        })
    }

    /// Round a position up to the start of the next record: 8-byte alignment
    /// plus the page header when the position sits on a page boundary.
    fn align_record_start(&mut self, pos: u64) -> Result<u64> {
        let mut pos = (pos + MAX_ALIGN - 1) & !(MAX_ALIGN - 1);
        if pos % XLOG_BLCKSZ == 0 {
            let header = self.page_header(pos)?;
            if header.info & XLP_FIRST_IS_CONTRECORD != 0 {
                return Err(Error::Corruption(format!(
                    "unexpected continuation record at {}",
                    Lsn(pos)
                ))
                .into());
            }
            pos += header.size;
        }
        Ok(pos)
    }

    /// Assemble one whole record starting at `start`, following continuation
    /// headers across pages and segments. Returns the record bytes and the
    /// stream position just past its last byte.
    fn read_record(&mut self, start: u64) -> Result<(Vec<u8>, u64)> {
        let mut out: Vec<u8> = Vec::with_capacity(SIZE_OF_XLOG_RECORD);
        let mut needed = 4usize;
        let mut tot_len: Option<usize> = None;
        let mut pos = start;

        while out.len() < needed {
            if pos % XLOG_BLCKSZ == 0 {
                let header = self.page_header(pos)?;
                if header.info & XLP_FIRST_IS_CONTRECORD == 0 {
                    return Err(Error::Corruption(format!(
                        "missing continuation record flag at {}",
                        Lsn(pos)
                    ))
                    .into());
                }
                if let Some(total) = tot_len {
                    let expected = total - out.len();
                    if header.rem_len as usize != expected {
                        return Err(Error::Corruption(format!(
                            "invalid continuation length {} at {}, expected {expected}",
                            header.rem_len,
                            Lsn(pos)
                        ))
                        .into());
                    }
                }
                pos += header.size;
            }

            let page_end = (pos / XLOG_BLCKSZ + 1) * XLOG_BLCKSZ;
            let take = (needed - out.len()).min((page_end - pos) as usize);
            let chunk = self.bytes(pos, take)?;
            out.extend_from_slice(chunk);
            pos += take as u64;

            if tot_len.is_none() && out.len() >= 4 {
                let total = u32::from_le_bytes(out[0..4].try_into().unwrap()) as usize;
                if total == 0 {
                    return Err(Error::Corruption(format!(
                        "unexpected end of WAL at {}",
                        Lsn(start)
                    ))
                    .into());
                }
                if total < SIZE_OF_XLOG_RECORD {
                    return Err(Error::Corruption(format!(
                        "invalid record length {total} at {}",
                        Lsn(start)
                    ))
                    .into());
                }
                tot_len = Some(total);
                needed = total;
            }
        }

        verify_record_crc(&out, Lsn(start))?;
        Ok((out, pos))
    }
}

fn verify_record_crc(record: &[u8], lsn: Lsn) -> Result<()> {
    let stored = u32::from_le_bytes(record[20..24].try_into().unwrap());
    let crc = crc32c::crc32c_append(
        crc32c::crc32c(&record[SIZE_OF_XLOG_RECORD..]),
        &record[..20],
    );
    if crc != stored {
        return Err(Error::Corruption(format!(
            "incorrect checksum in WAL record at {lsn}: expected {stored:08X}, computed {crc:08X}"
        ))
        .into());
    }
    Ok(())
}

/// Decode one record's block references into the sink. Returns true when the
/// record is a WAL switch, in which case the rest of the segment is padding.
fn decode_record(record: &[u8], lsn: Lsn, sink: &mut dyn BlockChangeSink) -> Result<bool> {
    let info = record[16];
    let rmid = record[17];
    let body = &record[SIZE_OF_XLOG_RECORD..];

    let bad = || Error::Corruption(format!("invalid record structure at {lsn}"));

    let mut ofs = 0usize;
    let mut remaining = body.len();
    let mut datatotal = 0usize;
    let mut main_data_len = 0usize;
    let mut last_rnode: Option<RelFileNode> = None;

    let take = |ofs: &mut usize, remaining: &mut usize, n: usize| -> Result<usize> {
        if *remaining < n || *ofs + n > body.len() {
            return Err(bad().into());
        }
        let at = *ofs;
        *ofs += n;
        *remaining -= n;
        Ok(at)
    };

    while remaining > datatotal {
        let at = take(&mut ofs, &mut remaining, 1)?;
        let block_id = body[at];
        match block_id {
            XLR_BLOCK_ID_DATA_SHORT => {
                let at = take(&mut ofs, &mut remaining, 1)?;
                main_data_len = body[at] as usize;
                datatotal += main_data_len;
            }
            XLR_BLOCK_ID_DATA_LONG => {
                let at = take(&mut ofs, &mut remaining, 4)?;
                main_data_len =
                    u32::from_le_bytes(body[at..at + 4].try_into().unwrap()) as usize;
                datatotal += main_data_len;
            }
            XLR_BLOCK_ID_ORIGIN => {
                take(&mut ofs, &mut remaining, 2)?;
            }
            id if id <= XLR_MAX_BLOCK_ID => {
                let at = take(&mut ofs, &mut remaining, 3)?;
                let fork_flags = body[at];
                let data_len =
                    u16::from_le_bytes(body[at + 1..at + 3].try_into().unwrap()) as usize;
                let fork = ForkNumber::from_u8(fork_flags & BKPBLOCK_FORK_MASK)?;

                if fork_flags & BKPBLOCK_HAS_DATA != 0 {
                    datatotal += data_len;
                } else if data_len != 0 {
                    return Err(bad().into());
                }

                if fork_flags & BKPBLOCK_HAS_IMAGE != 0 {
                    let at = take(&mut ofs, &mut remaining, 5)?;
                    let image_len =
                        u16::from_le_bytes(body[at..at + 2].try_into().unwrap()) as usize;
                    let bimg_info = body[at + 4];
                    if bimg_info & BKPIMAGE_IS_COMPRESSED != 0
                        && bimg_info & BKPIMAGE_HAS_HOLE != 0
                    {
                        take(&mut ofs, &mut remaining, 2)?;
                    }
                    datatotal += image_len;
                }

                let rnode = if fork_flags & BKPBLOCK_SAME_REL == 0 {
                    let at = take(&mut ofs, &mut remaining, 12)?;
                    let rnode = RelFileNode {
                        spcnode: u32::from_le_bytes(body[at..at + 4].try_into().unwrap()),
                        dbnode: u32::from_le_bytes(body[at + 4..at + 8].try_into().unwrap()),
                        relnode: u32::from_le_bytes(body[at + 8..at + 12].try_into().unwrap()),
                    };
                    last_rnode = Some(rnode);
                    rnode
                } else {
                    last_rnode.ok_or_else(bad)?
                };

                let at = take(&mut ofs, &mut remaining, 4)?;
                let blkno = u32::from_le_bytes(body[at..at + 4].try_into().unwrap());
                sink.process_block_change(fork, rnode, blkno);
            }
            _ => return Err(bad().into()),
        }
    }

    // Relation truncation carries its target in the main data, which sits at
    // the very end of the record body.
    if rmid == RM_SMGR_ID && info & 0xF0 == XLOG_SMGR_TRUNCATE && main_data_len >= 20 {
        let main = &body[body.len() - main_data_len..];
        let blkno = u32::from_le_bytes(main[0..4].try_into().unwrap());
        let rnode = RelFileNode {
            spcnode: u32::from_le_bytes(main[4..8].try_into().unwrap()),
            dbnode: u32::from_le_bytes(main[8..12].try_into().unwrap()),
            relnode: u32::from_le_bytes(main[12..16].try_into().unwrap()),
        };
        let flags = u32::from_le_bytes(main[16..20].try_into().unwrap());
        if flags & SMGR_TRUNCATE_HEAP != 0 {
            sink.process_block_change(ForkNumber::Main, rnode, blkno);
        }
    }

    Ok(rmid == RM_XLOG_ID && info & 0xF0 == XLOG_SWITCH)
}
