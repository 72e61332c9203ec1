//! Locating and parsing the central directory.
//!
//! [`ArchiveReader`] finds the end-of-central-directory record by scanning
//! backwards from the end of the file, follows the ZIP64 locator when one is
//! present, and validates the central directory table record by record. The
//! table is kept as one byte buffer; entries are decoded from it lazily.

use std::io::{self, Write};

use memchr::memmem;
use zerocopy::byteorder::little_endian::{U16, U32, U64};
use zipfs_common::BinaryReader;

use crate::channel::ArchiveChannel;
use crate::zip::{
    flags, needs_zip64, CentralDirectoryHeader, CompressionMethod, Eocd64Locator, Eocd64Record,
    EocdRecord, LocalFileHeader, MAX_COMMENT_LEN, VERSION_ZIP64, ZIP64_SENTINEL_16,
    ZIP64_SENTINEL_32,
};
use crate::{Error, Result};

/// The archive's trailing record, with ZIP64 values already substituted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct DirectoryRecord {
    pub disk_number: u32,
    pub cen_disk: u32,
    pub entries_on_disk: u64,
    pub total_entries: u64,
    pub cen_len: u64,
    pub cen_offset: u64,
    pub comment: Vec<u8>,
    /// Absolute position of the end record (the ZIP64 one when present).
    pub end_pos: u64,
    pub zip64: bool,
}

impl DirectoryRecord {
    /// Record describing a freshly written central directory.
    pub fn new(total_entries: u64, cen_offset: u64, cen_len: u64, comment: Vec<u8>) -> Self {
        Self {
            entries_on_disk: total_entries,
            total_entries,
            cen_len,
            cen_offset,
            comment,
            end_pos: cen_offset + cen_len,
            ..Self::default()
        }
    }

    /// Write the end records for a central directory that was written at
    /// `cen_offset`, switching to the ZIP64 form when a value overflows or
    /// when `force_zip64` is set.
    pub fn write_to<W: Write>(&self, out: &mut W, force_zip64: bool) -> io::Result<()> {
        let mut zip64 = force_zip64;

        let cen_len = if needs_zip64(self.cen_len) {
            zip64 = true;
            ZIP64_SENTINEL_32
        } else {
            self.cen_len as u32
        };
        let cen_offset = if needs_zip64(self.cen_offset) {
            zip64 = true;
            ZIP64_SENTINEL_32
        } else {
            self.cen_offset as u32
        };
        let count = if self.total_entries >= ZIP64_SENTINEL_16 as u64 {
            zip64 = true;
            ZIP64_SENTINEL_16
        } else {
            self.total_entries as u16
        };

        if zip64 {
            let end64_pos = self.cen_offset + self.cen_len;
            Eocd64Record {
                record_size: U64::new(Eocd64Record::SIZE as u64 - 12),
                version_made_by: U16::new(VERSION_ZIP64),
                version_needed: U16::new(VERSION_ZIP64),
                disk_number: U32::new(0),
                central_dir_disk: U32::new(0),
                central_dir_count_disk: U64::new(self.total_entries),
                central_dir_count_total: U64::new(self.total_entries),
                central_dir_size: U64::new(self.cen_len),
                central_dir_offset: U64::new(self.cen_offset),
            }
            .write_to(out)?;
            Eocd64Locator {
                zip64_eocd_disk: U32::new(0),
                zip64_eocd_offset: U64::new(end64_pos),
                total_disks: U32::new(1),
            }
            .write_to(out)?;
        }

        let comment = &self.comment[..self.comment.len().min(MAX_COMMENT_LEN)];
        EocdRecord {
            disk_number: U16::new(0),
            central_dir_disk: U16::new(0),
            central_dir_count_disk: U16::new(count),
            central_dir_count_total: U16::new(count),
            central_dir_size: U32::new(cen_len),
            central_dir_offset: U32::new(cen_offset),
            comment_length: U16::new(comment.len() as u16),
        }
        .write_to(out)?;
        out.write_all(comment)
    }
}

/// The validated central directory of an archive.
#[derive(Debug, Default)]
pub(crate) struct CentralDirectory {
    pub end: DirectoryRecord,
    /// Raw central directory table.
    pub cen: Vec<u8>,
    /// Position local header offsets are relative to (non-zero for archives
    /// with a prefixed stub).
    pub loc_base: u64,
    /// Start of every record in `cen`, in table order.
    pub records: Vec<usize>,
}

impl CentralDirectory {
    /// Name bytes of the record starting at `pos`.
    pub fn name_at(&self, pos: usize) -> &[u8] {
        let len = u16::from_le_bytes([self.cen[pos + 28], self.cen[pos + 29]]) as usize;
        let start = pos + CentralDirectoryHeader::SIZE;
        &self.cen[start..start + len]
    }
}

/// Reads the directory structures of an archive file.
pub(crate) struct ArchiveReader<'a> {
    channel: &'a ArchiveChannel,
}

impl<'a> ArchiveReader<'a> {
    pub fn new(channel: &'a ArchiveChannel) -> Self {
        Self { channel }
    }

    /// Locate, read and validate the central directory.
    pub fn read_central_directory(&self) -> Result<CentralDirectory> {
        let end = self.find_end()?;
        if end.disk_number != 0 || end.cen_disk != 0 || end.entries_on_disk != end.total_entries
        {
            return Err(Error::Unsupported("archives spanning multiple disks".into()));
        }
        if end.end_pos == 0 {
            // only an end record, no entries
            return Ok(CentralDirectory {
                end,
                ..CentralDirectory::default()
            });
        }
        if end.cen_len > end.end_pos {
            return Err(Error::format("bad central directory size"));
        }
        let cen_pos = end.end_pos - end.cen_len;
        let loc_base = cen_pos
            .checked_sub(end.cen_offset)
            .ok_or_else(|| Error::format("bad central directory offset"))?;

        let mut cen = vec![0u8; end.cen_len as usize];
        self.channel.read_exact_at(&mut cen, cen_pos)?;
        let records = parse_records(&cen)?;

        if records.len() as u64 != end.total_entries {
            return Err(Error::format(format!(
                "end record declares {} entries, central directory holds {}",
                end.total_entries,
                records.len()
            )));
        }

        tracing::debug!(
            entries = records.len(),
            zip64 = end.zip64,
            loc_base,
            "read central directory"
        );

        Ok(CentralDirectory {
            end,
            cen,
            loc_base,
            records,
        })
    }

    /// Scan backwards for the end-of-central-directory record.
    pub fn find_end(&self) -> Result<DirectoryRecord> {
        let len = self.channel.len();
        if len < EocdRecord::SIZE as u64 {
            return Err(Error::format("file too short to be a ZIP archive"));
        }

        let window = len.min((EocdRecord::SIZE + MAX_COMMENT_LEN) as u64) as usize;
        let start = len - window as u64;
        let mut buf = vec![0u8; window];
        self.channel.read_exact_at(&mut buf, start)?;

        for i in memmem::rfind_iter(&buf, &EocdRecord::MAGIC) {
            if i + EocdRecord::SIZE > buf.len() {
                continue;
            }
            let mut reader = BinaryReader::new_at(&buf, i + 4);
            let eocd: EocdRecord = reader.read_struct()?;
            let end_pos = start + i as u64;
            let comment_len = eocd.comment_length.get() as usize;

            // trailing bytes after the comment: accept only if the record
            // points at a real central directory
            if end_pos + (EocdRecord::SIZE + comment_len) as u64 != len
                && !self.points_at_directory(&eocd, end_pos)?
            {
                continue;
            }

            let comment_start = i + EocdRecord::SIZE;
            let comment_end = (comment_start + comment_len).min(buf.len());
            let mut record = DirectoryRecord {
                disk_number: eocd.disk_number.get() as u32,
                cen_disk: eocd.central_dir_disk.get() as u32,
                entries_on_disk: eocd.central_dir_count_disk.get() as u64,
                total_entries: eocd.central_dir_count_total.get() as u64,
                cen_len: eocd.central_dir_size.get() as u64,
                cen_offset: eocd.central_dir_offset.get() as u64,
                comment: buf[comment_start..comment_end].to_vec(),
                end_pos,
                zip64: false,
            };
            self.apply_zip64_end(&mut record, &eocd)?;
            return Ok(record);
        }

        Err(Error::format("end of central directory record not found"))
    }

    fn points_at_directory(&self, eocd: &EocdRecord, end_pos: u64) -> Result<bool> {
        let Some(cen_pos) = end_pos.checked_sub(eocd.central_dir_size.get() as u64) else {
            return Ok(false);
        };
        let Some(loc_pos) = cen_pos.checked_sub(eocd.central_dir_offset.get() as u64) else {
            return Ok(false);
        };
        Ok(self.signature_at(cen_pos)? == Some(CentralDirectoryHeader::SIGNATURE)
            && self.signature_at(loc_pos)? == Some(LocalFileHeader::SIGNATURE))
    }

    fn signature_at(&self, pos: u64) -> Result<Option<u32>> {
        let mut sig = [0u8; 4];
        if self.channel.read_at(&mut sig, pos)? != sig.len() {
            return Ok(None);
        }
        Ok(Some(u32::from_le_bytes(sig)))
    }

    /// A ZIP64 end record may be present even when no field overflows, so
    /// the locator is always looked for.
    fn apply_zip64_end(&self, record: &mut DirectoryRecord, eocd: &EocdRecord) -> Result<()> {
        let required = eocd.is_zip64();
        let missing = |what: &str| {
            if required {
                Err(Error::format(format!("ZIP64 end of central directory {what} not found")))
            } else {
                Ok(())
            }
        };

        if record.end_pos < Eocd64Locator::SIZE as u64 {
            return missing("locator");
        }
        let mut buf = [0u8; Eocd64Locator::SIZE];
        self.channel
            .read_exact_at(&mut buf, record.end_pos - Eocd64Locator::SIZE as u64)?;
        let mut reader = BinaryReader::new(&buf);
        if reader.read_u32()? != Eocd64Locator::SIGNATURE {
            return missing("locator");
        }
        let locator: Eocd64Locator = reader.read_struct()?;
        let end64_pos = locator.zip64_eocd_offset.get();

        let mut buf = [0u8; Eocd64Record::SIZE];
        if self.channel.read_at(&mut buf, end64_pos)? != buf.len() {
            return missing("record");
        }
        let mut reader = BinaryReader::new(&buf);
        let signature = reader.read_u32()?;
        if signature != Eocd64Record::SIGNATURE {
            if required {
                return Err(Error::InvalidSignature {
                    expected: Eocd64Record::SIGNATURE,
                    actual: signature,
                });
            }
            return Ok(());
        }
        let end64: Eocd64Record = reader.read_struct()?;
        let cen_len = end64.central_dir_size.get();
        let cen_offset = end64.central_dir_offset.get();
        let total = end64.central_dir_count_total.get();

        // a narrow field that is not a sentinel must agree with its wide copy
        if (cen_len != record.cen_len && eocd.central_dir_size.get() != ZIP64_SENTINEL_32)
            || (cen_offset != record.cen_offset
                && eocd.central_dir_offset.get() != ZIP64_SENTINEL_32)
            || (total != record.total_entries
                && eocd.central_dir_count_total.get() != ZIP64_SENTINEL_16)
        {
            tracing::debug!("ignoring inconsistent ZIP64 end record");
            return Ok(());
        }

        record.disk_number = end64.disk_number.get();
        record.cen_disk = end64.central_dir_disk.get();
        record.entries_on_disk = end64.central_dir_count_disk.get();
        record.total_entries = total;
        record.cen_len = cen_len;
        record.cen_offset = cen_offset;
        record.end_pos = end64_pos;
        record.zip64 = true;
        Ok(())
    }
}

/// Validate the central directory table, returning each record's start.
fn parse_records(cen: &[u8]) -> Result<Vec<usize>> {
    let limit = cen.len();
    let mut records = Vec::new();
    let mut pos = 0;

    while pos < limit {
        if pos + CentralDirectoryHeader::SIZE > limit {
            return Err(Error::format("truncated central directory header"));
        }
        let mut reader = BinaryReader::new_at(cen, pos);
        let signature = reader.read_u32()?;
        if signature != CentralDirectoryHeader::SIGNATURE {
            return Err(Error::InvalidSignature {
                expected: CentralDirectoryHeader::SIGNATURE,
                actual: signature,
            });
        }
        let header: CentralDirectoryHeader = reader.read_struct()?;
        if header.flags.get() & flags::ENCRYPTED != 0 {
            return Err(Error::Unsupported("encrypted entry".into()));
        }
        CompressionMethod::parse(header.compression_method.get())?;

        let next = pos + CentralDirectoryHeader::SIZE + header.variable_data_size();
        if next > limit {
            return Err(Error::format("central directory header runs past the table"));
        }
        records.push(pos);
        pos = next;
    }

    Ok(records)
}
