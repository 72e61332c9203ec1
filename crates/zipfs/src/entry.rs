//! Archive entries and their on-disk encoding.
//!
//! An [`Entry`] is the decoded form of one central directory record, or the
//! pending replacement for one. Its [`EntryKind`] says where the payload
//! currently lives, which decides how the sync engine writes it back.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use byteorder::{LittleEndian, WriteBytesExt};
use zerocopy::byteorder::little_endian::{U16, U32};
use zipfs_common::{BinaryReader, FileTime};

use crate::channel::ArchiveChannel;
use crate::zip::extra::{self, ExtraFields};
use crate::zip::{
    flags, needs_zip64, CentralDirectoryHeader, CompressionMethod, DataDescriptor,
    LocalFileHeader, MAX_FIELD_LEN, VERSION_ZIP64, ZIP64_SENTINEL_32,
};
use crate::{Error, Result};

/// Compressed payload of a staged entry.
#[derive(Debug, Clone)]
pub(crate) enum StagedData {
    Bytes(Arc<[u8]>),
    File(PathBuf),
}

/// Where an entry's payload lives.
#[derive(Debug, Clone)]
pub(crate) enum EntryKind {
    /// Unmodified; the payload is in the archive at `locoff`.
    Cen,
    /// Written through an [`EntryWriter`](crate::EntryWriter); payload is
    /// already compressed.
    Staged(StagedData),
    /// Uncompressed content in a scratch file, compressed at sync.
    RawBacked(PathBuf),
    /// Renamed or retimed copy of an archive entry; the payload is still in
    /// the archive at `locoff`.
    MetadataCopy,
}

impl EntryKind {
    /// Staged with no content, as for directories.
    pub fn empty() -> Self {
        Self::Staged(StagedData::Bytes(Arc::from(Vec::new())))
    }
}

/// A decoded archive entry.
#[derive(Debug, Clone)]
pub(crate) struct Entry {
    pub name: Vec<u8>,
    pub kind: EntryKind,
    pub version_made: u16,
    pub version: u16,
    pub flag: u16,
    pub method: CompressionMethod,
    pub mtime: FileTime,
    pub atime: Option<FileTime>,
    pub ctime: Option<FileTime>,
    pub crc: u32,
    pub csize: u64,
    pub size: u64,
    /// Extra field blocks other than ZIP64 and timestamps.
    pub extra: Vec<u8>,
    pub comment: Vec<u8>,
    pub attrs: u16,
    pub attrs_ex: u32,
    /// Local header offset, relative to the archive's local header base.
    pub locoff: u64,
}

impl Entry {
    /// A new, empty entry stamped with the current time.
    pub fn new(name: Vec<u8>, kind: EntryKind, method: CompressionMethod) -> Self {
        Self {
            name,
            kind,
            version_made: method.version_needed(),
            version: method.version_needed(),
            flag: 0,
            method,
            mtime: FileTime::now(),
            atime: None,
            ctime: None,
            crc: 0,
            csize: 0,
            size: 0,
            extra: Vec::new(),
            comment: Vec::new(),
            attrs: 0,
            attrs_ex: 0,
            locoff: 0,
        }
    }

    #[inline]
    pub fn is_dir(&self) -> bool {
        self.name.ends_with(b"/")
    }

    /// Decode the central directory record at `pos`.
    ///
    /// With `extended_timestamps` set, access and creation times are read from
    /// the local header's extended timestamp block, since the central copy
    /// only carries the modification time.
    pub fn read_cen(
        cen: &[u8],
        pos: usize,
        channel: &ArchiveChannel,
        loc_base: u64,
        extended_timestamps: bool,
    ) -> Result<Self> {
        let mut reader = BinaryReader::new_at(cen, pos);
        reader.expect_magic(&CentralDirectoryHeader::MAGIC)?;
        let header: CentralDirectoryHeader = reader.read_struct()?;
        let name = reader.read_bytes(header.file_name_length.get() as usize)?;
        let extra = reader.read_bytes(header.extra_field_length.get() as usize)?;
        let comment = reader.read_bytes(header.file_comment_length.get() as usize)?;

        let mut entry = Self {
            name: name.to_vec(),
            kind: EntryKind::Cen,
            version_made: header.version_made_by.get(),
            version: header.version_needed.get(),
            flag: header.flags.get(),
            method: CompressionMethod::parse(header.compression_method.get())?,
            mtime: FileTime::from_dos(header.last_modified.get()),
            atime: None,
            ctime: None,
            crc: header.crc32.get(),
            csize: header.compressed_size.get() as u64,
            size: header.uncompressed_size.get() as u64,
            extra: Vec::new(),
            comment: comment.to_vec(),
            attrs: header.internal_attrs.get(),
            attrs_ex: header.external_attrs.get(),
            locoff: header.local_header_offset.get() as u64,
        };
        entry.read_extra(extra, channel, loc_base, extended_timestamps)?;
        Ok(entry)
    }

    fn read_extra(
        &mut self,
        extra: &[u8],
        channel: &ArchiveChannel,
        loc_base: u64,
        extended_timestamps: bool,
    ) -> Result<()> {
        let mut kept = Vec::new();
        for (tag, data) in ExtraFields::new(extra) {
            match tag {
                extra::ZIP64 => {
                    let mut reader = BinaryReader::new(data);
                    if self.size == ZIP64_SENTINEL_32 as u64 {
                        match reader.read_u64() {
                            Ok(v) => self.size = v,
                            Err(_) => continue,
                        }
                    }
                    if self.csize == ZIP64_SENTINEL_32 as u64 {
                        match reader.read_u64() {
                            Ok(v) => self.csize = v,
                            Err(_) => continue,
                        }
                    }
                    if self.locoff == ZIP64_SENTINEL_32 as u64 {
                        if let Ok(v) = reader.read_u64() {
                            self.locoff = v;
                        }
                    }
                }
                extra::NTFS => {
                    if let Some(times) = extra::parse_ntfs(data) {
                        self.apply_times(times);
                    }
                }
                extra::EXTENDED_TIMESTAMP => {
                    let times = if extended_timestamps {
                        self.local_timestamps(channel, loc_base)?
                    } else {
                        None
                    };
                    let times = times.unwrap_or_else(|| extra::parse_extended_timestamp(data));
                    self.apply_times(times);
                }
                _ => {
                    kept.write_u16::<LittleEndian>(tag)?;
                    kept.write_u16::<LittleEndian>(data.len() as u16)?;
                    kept.extend_from_slice(data);
                }
            }
        }
        self.extra = kept;
        Ok(())
    }

    fn apply_times(&mut self, times: extra::Timestamps) {
        if let Some(mtime) = times.mtime {
            self.mtime = mtime;
        }
        self.atime = times.atime.or(self.atime);
        self.ctime = times.ctime.or(self.ctime);
    }

    /// The extended timestamp block of the local header, if it has one.
    fn local_timestamps(
        &self,
        channel: &ArchiveChannel,
        loc_base: u64,
    ) -> Result<Option<extra::Timestamps>> {
        let pos = loc_base + self.locoff;
        let header = read_local_header(channel, pos)?;
        let extra_len = header.extra_field_length.get() as usize;
        if extra_len < 9 {
            return Ok(None);
        }
        let mut buf = vec![0u8; extra_len];
        let extra_pos =
            pos + LocalFileHeader::SIZE as u64 + header.file_name_length.get() as u64;
        channel.read_exact_at(&mut buf, extra_pos)?;
        Ok(ExtraFields::new(&buf)
            .find(|(tag, _)| *tag == extra::EXTENDED_TIMESTAMP)
            .map(|(_, data)| extra::parse_extended_timestamp(data)))
    }

    /// Absolute position of the payload inside the archive.
    pub fn data_offset(&self, channel: &ArchiveChannel, loc_base: u64) -> Result<u64> {
        let pos = loc_base + self.locoff;
        let header = read_local_header(channel, pos)?;
        Ok(pos + LocalFileHeader::SIZE as u64 + header.variable_data_size() as u64)
    }

    /// Bytes of trailing descriptor following the payload.
    pub fn descriptor_len(&self) -> u64 {
        if self.flag & flags::DATA_DESCRIPTOR != 0 {
            DataDescriptor::size_for(self.size, self.csize)
        } else {
            0
        }
    }

    pub fn write_descriptor<W: Write>(&self, out: &mut W) -> io::Result<u64> {
        DataDescriptor::write_to(out, self.crc, self.size, self.csize)
    }

    /// Fail if either header of this entry has a field too long to encode.
    ///
    /// The central header depends on `locoff`, so check after placing the
    /// entry.
    pub fn check_header_lengths(&self) -> io::Result<()> {
        self.write_loc(&mut io::sink())?;
        self.write_cen(&mut io::sink())?;
        Ok(())
    }

    /// Write a local file header, returning the bytes written.
    pub fn write_loc<W: Write>(&self, out: &mut W) -> io::Result<u64> {
        let descriptor = self.flag & flags::DATA_DESCRIPTOR != 0;
        let zip64 = !descriptor && (needs_zip64(self.size) || needs_zip64(self.csize));
        let ext_len = if extra::has_timestamps(&self.extra) {
            0
        } else {
            9 + 4 * (self.atime.is_some() as usize + self.ctime.is_some() as usize)
        };
        let zip64_len = if zip64 { 20 } else { 0 };
        check_field_lengths(self.name.len(), self.extra.len() + zip64_len + ext_len)?;

        let (crc, csize, size) = if descriptor {
            (0, 0, 0)
        } else if zip64 {
            (self.crc, ZIP64_SENTINEL_32, ZIP64_SENTINEL_32)
        } else {
            (self.crc, self.csize as u32, self.size as u32)
        };

        LocalFileHeader {
            version_needed: U16::new(if zip64 {
                VERSION_ZIP64
            } else {
                self.method.version_needed()
            }),
            flags: U16::new(self.flag),
            compression_method: U16::new(self.method.as_u16()),
            last_modified: U32::new(self.mtime.to_dos()),
            crc32: U32::new(crc),
            compressed_size: U32::new(csize),
            uncompressed_size: U32::new(size),
            file_name_length: U16::new(self.name.len() as u16),
            extra_field_length: U16::new((self.extra.len() + zip64_len + ext_len) as u16),
        }
        .write_to(out)?;
        out.write_all(&self.name)?;

        if zip64 {
            out.write_u16::<LittleEndian>(extra::ZIP64)?;
            out.write_u16::<LittleEndian>(16)?;
            out.write_u64::<LittleEndian>(self.size)?;
            out.write_u64::<LittleEndian>(self.csize)?;
        }
        if ext_len != 0 {
            let mut flag = extra::EXTT_MTIME;
            if self.atime.is_some() {
                flag |= extra::EXTT_ATIME;
            }
            if self.ctime.is_some() {
                flag |= extra::EXTT_CTIME;
            }
            out.write_u16::<LittleEndian>(extra::EXTENDED_TIMESTAMP)?;
            out.write_u16::<LittleEndian>(ext_len as u16 - 4)?;
            out.write_u8(flag)?;
            out.write_u32::<LittleEndian>(self.mtime.to_unix_secs())?;
            for time in [self.atime, self.ctime].into_iter().flatten() {
                out.write_u32::<LittleEndian>(time.to_unix_secs())?;
            }
        }
        out.write_all(&self.extra)?;

        Ok((LocalFileHeader::SIZE + self.name.len() + self.extra.len() + zip64_len + ext_len)
            as u64)
    }

    /// Write a central directory record, returning the bytes written.
    pub fn write_cen<W: Write>(&self, out: &mut W) -> io::Result<u64> {
        let mut zip64_fields = Vec::with_capacity(3);
        let mut narrow = |value: u64| {
            if needs_zip64(value) {
                zip64_fields.push(value);
                ZIP64_SENTINEL_32
            } else {
                value as u32
            }
        };
        // ZIP64 field order is fixed: size, compressed size, offset
        let size = narrow(self.size);
        let csize = narrow(self.csize);
        let locoff = narrow(self.locoff);

        let zip64_len = if zip64_fields.is_empty() {
            0
        } else {
            4 + 8 * zip64_fields.len()
        };
        let ext_len = if extra::has_timestamps(&self.extra) {
            0
        } else {
            9
        };
        check_field_lengths(self.name.len(), self.extra.len() + zip64_len + ext_len)?;
        let comment = &self.comment[..self.comment.len().min(0xFFFF)];
        let version = if zip64_fields.is_empty() {
            self.method.version_needed()
        } else {
            VERSION_ZIP64
        };

        CentralDirectoryHeader {
            version_made_by: U16::new(self.version_made.max(version)),
            version_needed: U16::new(version),
            flags: U16::new(self.flag),
            compression_method: U16::new(self.method.as_u16()),
            last_modified: U32::new(self.mtime.to_dos()),
            crc32: U32::new(self.crc),
            compressed_size: U32::new(csize),
            uncompressed_size: U32::new(size),
            file_name_length: U16::new(self.name.len() as u16),
            extra_field_length: U16::new((self.extra.len() + zip64_len + ext_len) as u16),
            file_comment_length: U16::new(comment.len() as u16),
            disk_number_start: U16::new(0),
            internal_attrs: U16::new(self.attrs),
            external_attrs: U32::new(self.attrs_ex),
            local_header_offset: U32::new(locoff),
        }
        .write_to(out)?;
        out.write_all(&self.name)?;

        if zip64_len != 0 {
            out.write_u16::<LittleEndian>(extra::ZIP64)?;
            out.write_u16::<LittleEndian>(zip64_len as u16 - 4)?;
            for value in &zip64_fields {
                out.write_u64::<LittleEndian>(*value)?;
            }
        }
        if ext_len != 0 {
            // central copy carries the modification time only
            let mut flag = extra::EXTT_MTIME;
            if self.atime.is_some() {
                flag |= extra::EXTT_ATIME;
            }
            if self.ctime.is_some() {
                flag |= extra::EXTT_CTIME;
            }
            out.write_u16::<LittleEndian>(extra::EXTENDED_TIMESTAMP)?;
            out.write_u16::<LittleEndian>(5)?;
            out.write_u8(flag)?;
            out.write_u32::<LittleEndian>(self.mtime.to_unix_secs())?;
        }
        out.write_all(&self.extra)?;
        out.write_all(comment)?;

        Ok((CentralDirectoryHeader::SIZE
            + self.name.len()
            + self.extra.len()
            + zip64_len
            + ext_len
            + comment.len()) as u64)
    }

    pub fn attributes(&self) -> EntryAttributes {
        EntryAttributes {
            size: self.size,
            compressed_size: match self.kind {
                EntryKind::RawBacked(_) => None,
                _ => Some(self.csize),
            },
            crc: self.crc,
            method: self.method,
            is_dir: self.is_dir(),
            modified: Some(self.mtime),
            accessed: self.atime,
            created: self.ctime,
        }
    }
}

fn check_field_lengths(name: usize, extra: usize) -> io::Result<()> {
    if name > MAX_FIELD_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("entry name is {name} bytes, at most {MAX_FIELD_LEN} fit in a header"),
        ));
    }
    if extra > MAX_FIELD_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("extra fields total {extra} bytes, at most {MAX_FIELD_LEN} fit in a header"),
        ));
    }
    Ok(())
}

pub(crate) fn read_local_header(channel: &ArchiveChannel, pos: u64) -> Result<LocalFileHeader> {
    let mut buf = [0u8; LocalFileHeader::SIZE];
    channel.read_exact_at(&mut buf, pos)?;
    let mut reader = BinaryReader::new(&buf);
    let signature = reader.read_u32()?;
    if signature != LocalFileHeader::SIGNATURE {
        return Err(Error::InvalidSignature {
            expected: LocalFileHeader::SIGNATURE,
            actual: signature,
        });
    }
    Ok(reader.read_struct()?)
}

/// Metadata of an entry as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EntryAttributes {
    /// Uncompressed size in bytes.
    pub size: u64,
    /// Compressed size in bytes, or `None` while the content sits
    /// uncompressed in a channel's scratch file until the next sync.
    pub compressed_size: Option<u64>,
    /// CRC-32 of the uncompressed content.
    pub crc: u32,
    pub method: CompressionMethod,
    pub is_dir: bool,
    pub modified: Option<FileTime>,
    pub accessed: Option<FileTime>,
    pub created: Option<FileTime>,
}

impl EntryAttributes {
    /// Attributes of a directory with no record of its own.
    pub(crate) fn synthesized_dir() -> Self {
        Self {
            size: 0,
            compressed_size: Some(0),
            crc: 0,
            method: CompressionMethod::Store,
            is_dir: true,
            modified: None,
            accessed: None,
            created: None,
        }
    }
}
