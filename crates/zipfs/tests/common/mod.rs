//! Minimal ZIP writer for end-to-end tests.

use std::io::Write;
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, WriteBytesExt};
use flate2::write::DeflateEncoder;
use flate2::Compression;

/// DOS encoding of 2021-06-15 12:30:00.
pub const DOS_TIME: u32 = ((2021 - 1980) << 25) | (6 << 21) | (15 << 16) | (12 << 11) | (30 << 5);

pub struct Fixture {
    entries: Vec<(String, Vec<u8>, bool)>,
    zip64: bool,
    comment: Vec<u8>,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            zip64: false,
            comment: Vec::new(),
        }
    }

    pub fn deflated(mut self, name: &str, data: &[u8]) -> Self {
        self.entries.push((name.to_string(), data.to_vec(), true));
        self
    }

    pub fn stored(mut self, name: &str, data: &[u8]) -> Self {
        self.entries.push((name.to_string(), data.to_vec(), false));
        self
    }

    pub fn zip64(mut self) -> Self {
        self.zip64 = true;
        self
    }

    pub fn comment(mut self, comment: &[u8]) -> Self {
        self.comment = comment.to_vec();
        self
    }

    /// Compressed payload bytes of an entry as they appear in the archive.
    pub fn payload(data: &[u8], deflate: bool) -> Vec<u8> {
        if !deflate {
            return data.to_vec();
        }
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    pub fn write_to(&self, dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, self.build()).unwrap();
        path
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut central = Vec::new();
        for (name, data, deflate) in &self.entries {
            let payload = Self::payload(data, *deflate);
            let method: u16 = if *deflate { 8 } else { 0 };
            let crc = crc32fast::hash(data);
            let offset = out.len() as u64;
            let (size, csize) = (data.len() as u64, payload.len() as u64);
            let version: u16 = if self.zip64 { 45 } else { 20 };
            let narrow = |v: u64| if self.zip64 { u32::MAX } else { v as u32 };

            let mut local_extra = Vec::new();
            let mut central_extra = Vec::new();
            if self.zip64 {
                local_extra.write_u16::<LittleEndian>(0x0001).unwrap();
                local_extra.write_u16::<LittleEndian>(16).unwrap();
                local_extra.write_u64::<LittleEndian>(size).unwrap();
                local_extra.write_u64::<LittleEndian>(csize).unwrap();
                central_extra.write_u16::<LittleEndian>(0x0001).unwrap();
                central_extra.write_u16::<LittleEndian>(24).unwrap();
                central_extra.write_u64::<LittleEndian>(size).unwrap();
                central_extra.write_u64::<LittleEndian>(csize).unwrap();
                central_extra.write_u64::<LittleEndian>(offset).unwrap();
            }

            out.write_u32::<LittleEndian>(0x0403_4b50).unwrap();
            out.write_u16::<LittleEndian>(version).unwrap();
            out.write_u16::<LittleEndian>(0).unwrap();
            out.write_u16::<LittleEndian>(method).unwrap();
            out.write_u32::<LittleEndian>(DOS_TIME).unwrap();
            out.write_u32::<LittleEndian>(crc).unwrap();
            out.write_u32::<LittleEndian>(narrow(csize)).unwrap();
            out.write_u32::<LittleEndian>(narrow(size)).unwrap();
            out.write_u16::<LittleEndian>(name.len() as u16).unwrap();
            out.write_u16::<LittleEndian>(local_extra.len() as u16).unwrap();
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(&local_extra);
            out.extend_from_slice(&payload);

            central.write_u32::<LittleEndian>(0x0201_4b50).unwrap();
            central.write_u16::<LittleEndian>(version).unwrap();
            central.write_u16::<LittleEndian>(version).unwrap();
            central.write_u16::<LittleEndian>(0).unwrap();
            central.write_u16::<LittleEndian>(method).unwrap();
            central.write_u32::<LittleEndian>(DOS_TIME).unwrap();
            central.write_u32::<LittleEndian>(crc).unwrap();
            central.write_u32::<LittleEndian>(narrow(csize)).unwrap();
            central.write_u32::<LittleEndian>(narrow(size)).unwrap();
            central.write_u16::<LittleEndian>(name.len() as u16).unwrap();
            central.write_u16::<LittleEndian>(central_extra.len() as u16).unwrap();
            central.write_u16::<LittleEndian>(0).unwrap(); // comment
            central.write_u16::<LittleEndian>(0).unwrap(); // disk
            central.write_u16::<LittleEndian>(0).unwrap(); // internal attrs
            central.write_u32::<LittleEndian>(0).unwrap(); // external attrs
            central.write_u32::<LittleEndian>(narrow(offset)).unwrap();
            central.extend_from_slice(name.as_bytes());
            central.extend_from_slice(&central_extra);
        }

        let cen_offset = out.len() as u64;
        let cen_len = central.len() as u64;
        let count = self.entries.len() as u64;
        out.extend_from_slice(&central);

        if self.zip64 {
            let end64 = out.len() as u64;
            out.write_u32::<LittleEndian>(0x0606_4b50).unwrap();
            out.write_u64::<LittleEndian>(44).unwrap();
            out.write_u16::<LittleEndian>(45).unwrap();
            out.write_u16::<LittleEndian>(45).unwrap();
            out.write_u32::<LittleEndian>(0).unwrap();
            out.write_u32::<LittleEndian>(0).unwrap();
            out.write_u64::<LittleEndian>(count).unwrap();
            out.write_u64::<LittleEndian>(count).unwrap();
            out.write_u64::<LittleEndian>(cen_len).unwrap();
            out.write_u64::<LittleEndian>(cen_offset).unwrap();

            out.write_u32::<LittleEndian>(0x0706_4b50).unwrap();
            out.write_u32::<LittleEndian>(0).unwrap();
            out.write_u64::<LittleEndian>(end64).unwrap();
            out.write_u32::<LittleEndian>(1).unwrap();
        }

        let (count16, cen_len32, cen_offset32) = if self.zip64 {
            (u16::MAX, u32::MAX, u32::MAX)
        } else {
            (count as u16, cen_len as u32, cen_offset as u32)
        };
        out.write_u32::<LittleEndian>(0x0605_4b50).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u16::<LittleEndian>(count16).unwrap();
        out.write_u16::<LittleEndian>(count16).unwrap();
        out.write_u32::<LittleEndian>(cen_len32).unwrap();
        out.write_u32::<LittleEndian>(cen_offset32).unwrap();
        out.write_u16::<LittleEndian>(self.comment.len() as u16).unwrap();
        out.extend_from_slice(&self.comment);
        out
    }
}
