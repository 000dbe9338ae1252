//! OS structs carried inside directory listings.
//!
//! Only Darwin's 64-bit `struct stat64` is needed: it is what the agent
//! embeds in every `listdir_entry`. The layout is 144 bytes with explicit
//! padding after `st_rdev`.

use serde::Serialize;

use crate::codec::{WireReader, WireWriter};
use crate::error::Result;

/// Size of Darwin `struct stat64`.
pub const STAT64_SIZE: usize = 144;

/// `struct timespec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: i64,
}

impl Timespec {
    fn read(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            sec: r.get_i64()?,
            nsec: r.get_i64()?,
        })
    }

    fn write(&self, w: &mut WireWriter) {
        w.put_i64(self.sec);
        w.put_i64(self.nsec);
    }
}

/// Darwin `struct stat64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Stat64 {
    pub st_dev: i32,
    pub st_mode: u16,
    pub st_nlink: u16,
    pub st_ino: u64,
    pub st_uid: u32,
    pub st_gid: u32,
    pub st_rdev: i32,
    pub st_atime: Timespec,
    pub st_mtime: Timespec,
    pub st_ctime: Timespec,
    pub st_birthtime: Timespec,
    pub st_size: i64,
    pub st_blocks: i64,
    pub st_blksize: i32,
    pub st_flags: u32,
    pub st_gen: u32,
}

/// `S_IFMT` file type mask.
const S_IFMT: u16 = 0o170000;
const S_IFDIR: u16 = 0o040000;
const S_IFLNK: u16 = 0o120000;

impl Stat64 {
    pub fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let st_dev = r.get_i32()?;
        let st_mode = r.get_u16()?;
        let st_nlink = r.get_u16()?;
        let st_ino = r.get_u64()?;
        let st_uid = r.get_u32()?;
        let st_gid = r.get_u32()?;
        let st_rdev = r.get_i32()?;
        r.skip(4)?;
        let st_atime = Timespec::read(r)?;
        let st_mtime = Timespec::read(r)?;
        let st_ctime = Timespec::read(r)?;
        let st_birthtime = Timespec::read(r)?;
        let st_size = r.get_i64()?;
        let st_blocks = r.get_i64()?;
        let st_blksize = r.get_i32()?;
        let st_flags = r.get_u32()?;
        let st_gen = r.get_u32()?;
        // st_lspare, st_qspare[2]
        r.skip(4 + 16)?;

        Ok(Self {
            st_dev,
            st_mode,
            st_nlink,
            st_ino,
            st_uid,
            st_gid,
            st_rdev,
            st_atime,
            st_mtime,
            st_ctime,
            st_birthtime,
            st_size,
            st_blocks,
            st_blksize,
            st_flags,
            st_gen,
        })
    }

    pub fn encode(&self, w: &mut WireWriter) {
        w.put_i32(self.st_dev);
        w.put_u16(self.st_mode);
        w.put_u16(self.st_nlink);
        w.put_u64(self.st_ino);
        w.put_u32(self.st_uid);
        w.put_u32(self.st_gid);
        w.put_i32(self.st_rdev);
        w.put_padding(4);
        self.st_atime.write(w);
        self.st_mtime.write(w);
        self.st_ctime.write(w);
        self.st_birthtime.write(w);
        w.put_i64(self.st_size);
        w.put_i64(self.st_blocks);
        w.put_i32(self.st_blksize);
        w.put_u32(self.st_flags);
        w.put_u32(self.st_gen);
        w.put_padding(4 + 16);
    }

    pub fn is_dir(&self) -> bool {
        self.st_mode & S_IFMT == S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.st_mode & S_IFMT == S_IFLNK
    }
}

/// One entry of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    /// `d_type` as reported by `readdir`.
    pub d_type: u64,
    pub name: String,
    /// `lstat` of the entry (does not follow symlinks).
    pub lstat: Stat64,
    /// `stat` of the entry (follows symlinks).
    pub stat: Stat64,
}

impl DirEntry {
    /// Decode the part of a `listdir_entry` after its leading magic.
    pub fn decode_body(r: &mut WireReader<'_>) -> Result<Self> {
        let d_type = r.get_u64()?;
        let name = String::from_utf8_lossy(r.get_sized_bytes()?).into_owned();
        let lstat = Stat64::decode(r)?;
        let stat = Stat64::decode(r)?;
        Ok(Self {
            d_type,
            name,
            lstat,
            stat,
        })
    }

    /// Encode a full `listdir_entry`, magic included.
    pub fn encode(&self, magic: u64, w: &mut WireWriter) {
        w.put_u64(magic);
        w.put_u64(self.d_type);
        w.put_sized_bytes(self.name.as_bytes());
        self.lstat.encode(w);
        self.stat.encode(w);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_stat() -> Stat64 {
        Stat64 {
            st_dev: 16777220,
            st_mode: 0o040755,
            st_nlink: 3,
            st_ino: 0x1234_5678_9abc,
            st_uid: 501,
            st_gid: 20,
            st_rdev: 0,
            st_atime: Timespec { sec: 1, nsec: 2 },
            st_mtime: Timespec { sec: 3, nsec: 4 },
            st_ctime: Timespec { sec: 5, nsec: 6 },
            st_birthtime: Timespec { sec: 7, nsec: 8 },
            st_size: 4096,
            st_blocks: 8,
            st_blksize: 4096,
            st_flags: 0,
            st_gen: 0,
        }
    }

    #[test]
    fn test_stat64_size_and_offsets() {
        let mut w = WireWriter::new();
        sample_stat().encode(&mut w);
        let bytes = w.freeze();
        assert_eq!(bytes.len(), STAT64_SIZE);
        // st_ino at offset 8, st_size at offset 96
        assert_eq!(&bytes[8..16], &0x1234_5678_9abcu64.to_le_bytes());
        assert_eq!(&bytes[96..104], &4096i64.to_le_bytes());
    }

    #[test]
    fn test_stat64_roundtrip() {
        let mut w = WireWriter::new();
        sample_stat().encode(&mut w);
        let bytes = w.freeze();
        let decoded = Stat64::decode(&mut WireReader::new(&bytes)).unwrap();
        assert_eq!(decoded, sample_stat());
        assert!(decoded.is_dir());
        assert!(!decoded.is_symlink());
    }

    #[test]
    fn test_dir_entry_roundtrip() {
        let entry = DirEntry {
            d_type: 4,
            name: "Library".to_string(),
            lstat: sample_stat(),
            stat: sample_stat(),
        };
        let mut w = WireWriter::new();
        entry.encode(0x12345678, &mut w);
        let bytes = w.freeze();

        let mut r = WireReader::new(&bytes);
        assert_eq!(r.get_u64().unwrap(), 0x12345678);
        assert_eq!(DirEntry::decode_body(&mut r).unwrap(), entry);
        assert_eq!(r.remaining(), 0);
    }
}
