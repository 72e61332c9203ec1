//! Extra field blocks.
//!
//! The extra field is a sequence of `tag(2) size(2) data(size)` blocks. The
//! engine interprets three of them and carries every other block through a
//! rewrite untouched.

use zipfs_common::{BinaryReader, FileTime};

/// ZIP64 extended information.
pub const ZIP64: u16 = 0x0001;
/// NTFS high-resolution timestamps.
pub const NTFS: u16 = 0x000a;
/// Info-ZIP extended timestamp (Unix seconds).
pub const EXTENDED_TIMESTAMP: u16 = 0x5455;

/// Extended timestamp flag bits.
pub const EXTT_MTIME: u8 = 0x1;
pub const EXTT_ATIME: u8 = 0x2;
pub const EXTT_CTIME: u8 = 0x4;

/// Iterator over the `(tag, data)` blocks of an extra field.
///
/// Iteration stops at the first block whose declared size runs past the end.
#[derive(Debug, Clone)]
pub struct ExtraFields<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> ExtraFields<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }
}

impl<'a> Iterator for ExtraFields<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let mut reader = BinaryReader::new_at(self.data, self.position);
        let tag = reader.read_u16().ok()?;
        let size = reader.read_u16().ok()? as usize;
        let body = reader.read_bytes(size).ok()?;
        self.position = reader.position();
        Some((tag, body))
    }
}

/// Whether the extra field already carries NTFS or extended timestamps.
pub fn has_timestamps(extra: &[u8]) -> bool {
    ExtraFields::new(extra).any(|(tag, _)| tag == NTFS || tag == EXTENDED_TIMESTAMP)
}

/// Times decoded from a timestamp block; absent fields stay `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timestamps {
    pub mtime: Option<FileTime>,
    pub atime: Option<FileTime>,
    pub ctime: Option<FileTime>,
}

/// Decode an NTFS block (reserved u32, then attribute tag 0x0001 of size 24).
pub fn parse_ntfs(data: &[u8]) -> Option<Timestamps> {
    let mut reader = BinaryReader::new(data);
    reader.advance(4);
    if reader.read_u16().ok()? != 0x0001 || reader.read_u16().ok()? != 24 {
        return None;
    }
    Some(Timestamps {
        mtime: Some(FileTime::from_ntfs(reader.read_u64().ok()?)),
        atime: Some(FileTime::from_ntfs(reader.read_u64().ok()?)),
        ctime: Some(FileTime::from_ntfs(reader.read_u64().ok()?)),
    })
}

/// Decode an extended timestamp block.
///
/// The flag byte announces which times exist, but a central directory copy
/// only ever carries the modification time, so fields are read only while
/// data remains.
pub fn parse_extended_timestamp(data: &[u8]) -> Timestamps {
    let mut reader = BinaryReader::new(data);
    let mut times = Timestamps::default();
    let Ok(flag) = reader.read_u8() else {
        return times;
    };
    if flag & EXTT_MTIME != 0 {
        times.mtime = reader.read_u32().ok().map(FileTime::from_unix_secs);
    }
    if flag & EXTT_ATIME != 0 {
        times.atime = reader.read_u32().ok().map(FileTime::from_unix_secs);
    }
    if flag & EXTT_CTIME != 0 {
        times.ctime = reader.read_u32().ok().map(FileTime::from_unix_secs);
    }
    times
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iterate_blocks() {
        let data = [
            0x01, 0x00, 0x02, 0x00, 0xAA, 0xBB, // zip64, 2 bytes
            0x55, 0x54, 0x01, 0x00, 0x00, // extt, 1 byte
        ];
        let blocks: Vec<_> = ExtraFields::new(&data).collect();
        assert_eq!(blocks, vec![(ZIP64, &[0xAA, 0xBB][..]), (EXTENDED_TIMESTAMP, &[0x00][..])]);
        assert!(has_timestamps(&data));
    }

    #[test]
    fn test_truncated_block_stops() {
        let data = [0x01, 0x00, 0x08, 0x00, 0xAA];
        assert_eq!(ExtraFields::new(&data).count(), 0);
        assert!(!has_timestamps(&data));
    }

    #[test]
    fn test_extended_timestamp_central_copy() {
        // flags announce mtime+atime, only mtime present
        let data = [0x03, 0x10, 0x00, 0x00, 0x00];
        let times = parse_extended_timestamp(&data);
        assert_eq!(times.mtime, Some(FileTime::from_unix_secs(16)));
        assert_eq!(times.atime, None);
    }

    #[test]
    fn test_ntfs() {
        let mut data = vec![0, 0, 0, 0, 0x01, 0x00, 24, 0x00];
        for ticks in [116_444_736_000_000_000u64, 116_444_736_010_000_000, 116_444_736_020_000_000] {
            data.extend_from_slice(&ticks.to_le_bytes());
        }
        let times = parse_ntfs(&data).unwrap();
        assert_eq!(times.mtime, Some(FileTime::from_millis(0)));
        assert_eq!(times.atime, Some(FileTime::from_millis(1000)));
        assert_eq!(times.ctime, Some(FileTime::from_millis(2000)));
    }
}
