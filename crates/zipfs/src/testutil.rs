//! Builds real ZIP archives for unit tests.

use std::io::Write;
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};
use flate2::write::DeflateEncoder;
use flate2::Compression;
use zerocopy::byteorder::little_endian::{U16, U32, U64};
use zipfs_common::{crc, FileTime};

use crate::zip::{
    extra, flags, CentralDirectoryHeader, CompressionMethod, Eocd64Locator, Eocd64Record,
    EocdRecord, LocalFileHeader, VERSION_ZIP64, ZIP64_SENTINEL_16, ZIP64_SENTINEL_32,
};

/// Modification time stamped on every fixture entry (2020-01-01T00:00:00Z).
pub const FIXTURE_MTIME: FileTime = FileTime::from_millis(1_577_836_800_000);

struct FixtureEntry {
    name: Vec<u8>,
    data: Vec<u8>,
    method: CompressionMethod,
    extra: Vec<u8>,
}

/// Assembles an archive in memory.
#[derive(Default)]
pub struct ArchiveBuilder {
    entries: Vec<FixtureEntry>,
    comment: Vec<u8>,
    prefix: Vec<u8>,
    zip64: bool,
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A DEFLATE-compressed file entry.
    pub fn file(self, name: &str, data: &[u8]) -> Self {
        self.entry(name, data, CompressionMethod::Deflate, Vec::new())
    }

    /// A stored file entry.
    pub fn stored(self, name: &str, data: &[u8]) -> Self {
        self.entry(name, data, CompressionMethod::Store, Vec::new())
    }

    /// An explicit directory entry; `name` must end with `/`.
    pub fn dir(self, name: &str) -> Self {
        self.entry(name, b"", CompressionMethod::Store, Vec::new())
    }

    pub fn entry(mut self, name: &str, data: &[u8], method: CompressionMethod, extra: Vec<u8>) -> Self {
        self.entries.push(FixtureEntry {
            name: name.as_bytes().to_vec(),
            data: data.to_vec(),
            method,
            extra,
        });
        self
    }

    pub fn comment(mut self, comment: &[u8]) -> Self {
        self.comment = comment.to_vec();
        self
    }

    /// Bytes placed before the first local header, like a self-extractor stub.
    pub fn prefix(mut self, prefix: &[u8]) -> Self {
        self.prefix = prefix.to_vec();
        self
    }

    /// Store every size and offset in ZIP64 extra fields and end records.
    pub fn zip64(mut self) -> Self {
        self.zip64 = true;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut body = Vec::new();
        let mut central = Vec::new();
        let dos = FIXTURE_MTIME.to_dos();

        for entry in &self.entries {
            let payload = match entry.method {
                CompressionMethod::Store => entry.data.clone(),
                CompressionMethod::Deflate => {
                    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
                    encoder.write_all(&entry.data).unwrap();
                    encoder.finish().unwrap()
                }
            };
            let crc32 = crc::checksum(&entry.data);
            let size = entry.data.len() as u64;
            let csize = payload.len() as u64;
            let offset = body.len() as u64;
            let version = if self.zip64 {
                VERSION_ZIP64
            } else {
                entry.method.version_needed()
            };

            let mut local_extra = Vec::new();
            let mut central_extra = Vec::new();
            if self.zip64 {
                local_extra.write_u16::<LittleEndian>(extra::ZIP64).unwrap();
                local_extra.write_u16::<LittleEndian>(16).unwrap();
                local_extra.write_u64::<LittleEndian>(size).unwrap();
                local_extra.write_u64::<LittleEndian>(csize).unwrap();

                central_extra.write_u16::<LittleEndian>(extra::ZIP64).unwrap();
                central_extra.write_u16::<LittleEndian>(24).unwrap();
                central_extra.write_u64::<LittleEndian>(size).unwrap();
                central_extra.write_u64::<LittleEndian>(csize).unwrap();
                central_extra.write_u64::<LittleEndian>(offset).unwrap();
            }
            local_extra.extend_from_slice(&entry.extra);
            central_extra.extend_from_slice(&entry.extra);

            let narrow = |value: u64| {
                if self.zip64 {
                    ZIP64_SENTINEL_32
                } else {
                    value as u32
                }
            };

            LocalFileHeader {
                version_needed: U16::new(version),
                flags: U16::new(flags::UTF8),
                compression_method: U16::new(entry.method.as_u16()),
                last_modified: U32::new(dos),
                crc32: U32::new(crc32),
                compressed_size: U32::new(narrow(csize)),
                uncompressed_size: U32::new(narrow(size)),
                file_name_length: U16::new(entry.name.len() as u16),
                extra_field_length: U16::new(local_extra.len() as u16),
            }
            .write_to(&mut body)
            .unwrap();
            body.extend_from_slice(&entry.name);
            body.extend_from_slice(&local_extra);
            body.extend_from_slice(&payload);

            CentralDirectoryHeader {
                version_made_by: U16::new(version),
                version_needed: U16::new(version),
                flags: U16::new(flags::UTF8),
                compression_method: U16::new(entry.method.as_u16()),
                last_modified: U32::new(dos),
                crc32: U32::new(crc32),
                compressed_size: U32::new(narrow(csize)),
                uncompressed_size: U32::new(narrow(size)),
                file_name_length: U16::new(entry.name.len() as u16),
                extra_field_length: U16::new(central_extra.len() as u16),
                file_comment_length: U16::new(0),
                disk_number_start: U16::new(0),
                internal_attrs: U16::new(0),
                external_attrs: U32::new(0),
                local_header_offset: U32::new(narrow(offset)),
            }
            .write_to(&mut central)
            .unwrap();
            central.extend_from_slice(&entry.name);
            central.extend_from_slice(&central_extra);
        }

        let cen_offset = body.len() as u64;
        let cen_len = central.len() as u64;
        let count = self.entries.len() as u64;
        body.extend_from_slice(&central);

        if self.zip64 {
            let end64_pos = body.len() as u64;
            Eocd64Record {
                record_size: U64::new(44),
                version_made_by: U16::new(VERSION_ZIP64),
                version_needed: U16::new(VERSION_ZIP64),
                disk_number: U32::new(0),
                central_dir_disk: U32::new(0),
                central_dir_count_disk: U64::new(count),
                central_dir_count_total: U64::new(count),
                central_dir_size: U64::new(cen_len),
                central_dir_offset: U64::new(cen_offset),
            }
            .write_to(&mut body)
            .unwrap();
            Eocd64Locator {
                zip64_eocd_disk: U32::new(0),
                zip64_eocd_offset: U64::new(end64_pos),
                total_disks: U32::new(1),
            }
            .write_to(&mut body)
            .unwrap();
        }

        let (count16, cen_len32, cen_offset32) = if self.zip64 {
            (ZIP64_SENTINEL_16, ZIP64_SENTINEL_32, ZIP64_SENTINEL_32)
        } else {
            (count as u16, cen_len as u32, cen_offset as u32)
        };
        EocdRecord {
            disk_number: U16::new(0),
            central_dir_disk: U16::new(0),
            central_dir_count_disk: U16::new(count16),
            central_dir_count_total: U16::new(count16),
            central_dir_size: U32::new(cen_len32),
            central_dir_offset: U32::new(cen_offset32),
            comment_length: U16::new(self.comment.len() as u16),
        }
        .write_to(&mut body)
        .unwrap();
        body.extend_from_slice(&self.comment);

        let mut out = self.prefix.clone();
        out.extend_from_slice(&body);
        out
    }

    pub fn write(&self, path: &Path) {
        std::fs::write(path, self.build()).unwrap();
    }
}

/// Offset of the first occurrence of `needle` in `haystack`.
pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    memchr::memmem::find(haystack, needle)
}
