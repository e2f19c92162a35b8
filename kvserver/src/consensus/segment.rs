//! Append-only segment files backing the raft log.
//!
//! Layout: a 16-byte header (`start_index`, entry count, little-endian)
//! followed by length-prefixed entries. Entry offsets are rebuilt by a
//! forward scan on open.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const HEADER_LEN: u64 = 16;
const FRAME_LEN: u64 = 8;

#[derive(Debug)]
pub struct Segment {
    file: File,
    path: PathBuf,
    start_index: u64,
    count: u64,
    offsets: BTreeMap<u64, u64>,
}

impl Segment {
    /// Opens a segment file, creating it when absent. An existing file is
    /// scanned to rebuild entry offsets.
    pub fn open<P: AsRef<Path>>(path: P, start_index: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let mut segment = Segment {
            file,
            path: path.as_ref().to_path_buf(),
            start_index,
            count: 0,
            offsets: BTreeMap::new(),
        };

        if segment.file.metadata()?.len() == 0 {
            segment.write_header()?;
        } else {
            segment.read_header()?;
            segment.scan()?;
        }
        Ok(segment)
    }

    fn write_header(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.start_index.to_le_bytes())?;
        self.file.write_all(&self.count.to_le_bytes())?;
        Ok(())
    }

    fn read_header(&mut self) -> io::Result<()> {
        let mut buf = [0u8; HEADER_LEN as usize];
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(&mut buf)?;
        self.start_index = u64::from_le_bytes(buf[..8].try_into().unwrap());
        self.count = u64::from_le_bytes(buf[8..].try_into().unwrap());
        Ok(())
    }

    fn scan(&mut self) -> io::Result<()> {
        self.offsets.clear();
        let len = self.file.metadata()?.len();
        let mut pos = HEADER_LEN;
        let mut index = self.start_index;
        while pos < len && (index - self.start_index) < self.count {
            self.offsets.insert(index, pos);
            self.file.seek(SeekFrom::Start(pos))?;
            let frame = self.read_frame_len()?;
            pos += FRAME_LEN + frame;
            index += 1;
        }
        Ok(())
    }

    fn read_frame_len(&mut self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        self.file.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Appends entries after the current end, updating the header.
    pub fn append(&mut self, entries: &[Vec<u8>]) -> io::Result<()> {
        let mut pos = self.file.seek(SeekFrom::End(0))?;
        for entry in entries {
            self.file.write_all(&(entry.len() as u64).to_le_bytes())?;
            self.file.write_all(entry)?;
            self.offsets.insert(self.start_index + self.count, pos);
            self.count += 1;
            pos += FRAME_LEN + entry.len() as u64;
        }
        self.write_header()
    }

    /// Reads the entry stored at a log index.
    pub fn read_entry(&mut self, index: u64) -> io::Result<Vec<u8>> {
        let pos = *self.offsets.get(&index).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "index out of segment range")
        })?;
        self.file.seek(SeekFrom::Start(pos))?;
        let frame = self.read_frame_len()?;
        let mut entry = vec![0u8; frame as usize];
        self.file.read_exact(&mut entry)?;
        Ok(entry)
    }

    /// Drops all entries after `index`, keeping `index` itself.
    pub fn truncate(&mut self, index: u64) -> io::Result<()> {
        if index < self.start_index || index > self.end_index() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "index out of segment range",
            ));
        }
        if let Some(&cut) = self.offsets.get(&(index + 1)) {
            self.file.set_len(cut)?;
        }
        self.offsets.split_off(&(index + 1));
        self.count = index + 1 - self.start_index;
        self.write_header()
    }

    /// Removes the backing file; the segment must not be used afterwards.
    pub fn remove(self) -> io::Result<()> {
        std::fs::remove_file(&self.path)
    }

    pub fn start_index(&self) -> u64 {
        self.start_index
    }

    /// Index of the last stored entry; `start_index - 1` when empty.
    pub fn end_index(&self) -> u64 {
        self.start_index + self.count - 1
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn open_empty() {
        let temp = NamedTempFile::new().unwrap();
        let segment = Segment::open(temp.path(), 5).unwrap();
        assert_eq!(segment.start_index(), 5);
        assert!(segment.is_empty());
    }

    #[test]
    fn append_and_read() {
        let temp = NamedTempFile::new().unwrap();
        let mut segment = Segment::open(temp.path(), 1).unwrap();
        segment
            .append(&[b"first".to_vec(), b"second".to_vec()])
            .unwrap();

        assert_eq!(segment.end_index(), 2);
        assert_eq!(segment.read_entry(1).unwrap(), b"first");
        assert_eq!(segment.read_entry(2).unwrap(), b"second");
        assert!(segment.read_entry(3).is_err());
    }

    #[test]
    fn reopen_rebuilds_offsets() {
        let temp = NamedTempFile::new().unwrap();
        {
            let mut segment = Segment::open(temp.path(), 10).unwrap();
            segment
                .append(&[b"a".to_vec(), b"bb".to_vec(), b"ccc".to_vec()])
                .unwrap();
        }
        let mut segment = Segment::open(temp.path(), 10).unwrap();
        assert_eq!(segment.end_index(), 12);
        assert_eq!(segment.read_entry(11).unwrap(), b"bb");
    }

    #[test]
    fn truncate_drops_tail() {
        let temp = NamedTempFile::new().unwrap();
        let mut segment = Segment::open(temp.path(), 1).unwrap();
        segment
            .append(&[b"one".to_vec(), b"two".to_vec(), b"three".to_vec()])
            .unwrap();

        segment.truncate(2).unwrap();
        assert_eq!(segment.end_index(), 2);
        assert_eq!(segment.read_entry(2).unwrap(), b"two");
        assert!(segment.read_entry(3).is_err());

        // Appends continue after the cut.
        segment.append(&[b"four".to_vec()]).unwrap();
        assert_eq!(segment.read_entry(3).unwrap(), b"four");
    }
}
