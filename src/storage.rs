//! Where verified pieces end up.
//!
//! Storage works on the flat byte range formed by concatenating every file
//! of the torrent; piece `i` lives at offset `i * piece_length`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::debug;

use crate::torrent::{FileEntry, Torrent};

pub trait Storage: Send {
    /// Writes a verified piece at its logical offset
    fn write_piece(&mut self, index: usize, data: &[u8]) -> io::Result<()>;

    /// Reads `length` bytes of piece `index` back
    fn read_piece(&mut self, index: usize, length: usize) -> io::Result<Vec<u8>>;

    fn flush(&mut self) -> io::Result<()>;
}

/// Pieces written to the torrent's files below an output directory
#[derive(Debug)]
pub struct FileStorage {
    piece_length: u64,
    files: Vec<(FileEntry, File)>,
}

impl FileStorage {
    /// Creates (or opens) every file of `torrent` under `dir`, sized to its
    /// declared length
    pub fn create(dir: impl AsRef<Path>, torrent: &Torrent) -> io::Result<Self> {
        let mut files = Vec::new();
        let entries = torrent.files();
        if let Some(entry) = entries.iter().find(|e| !e.is_contained()) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} leaves the output directory", entry.path.display()),
            ));
        }

        for entry in entries {
            let path = dir.as_ref().join(&entry.path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;
            file.set_len(entry.length)?;
            debug!(path = %path.display(), length = entry.length, "opened output file");
            files.push((entry, file));
        }

        Ok(Self {
            piece_length: torrent.piece_length(),
            files,
        })
    }

    /// Calls `f` for every file slice covering `[start, start + len)`, with
    /// the position inside the file and the range inside the request
    fn for_each_span(
        &mut self,
        start: u64,
        len: usize,
        mut f: impl FnMut(&mut File, u64, std::ops::Range<usize>) -> io::Result<()>,
    ) -> io::Result<()> {
        let end = start + len as u64;
        let total = self
            .files
            .last()
            .map_or(0, |(entry, _)| entry.offset + entry.length);
        if end > total {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("range {start}..{end} is outside of the torrent"),
            ));
        }

        for (entry, file) in &mut self.files {
            let file_end = entry.offset + entry.length;
            if file_end <= start || entry.offset >= end {
                continue;
            }
            let from = start.max(entry.offset);
            let to = end.min(file_end);
            let range = (from - start) as usize..(to - start) as usize;
            f(file, from - entry.offset, range)?;
        }
        Ok(())
    }
}

impl Storage for FileStorage {
    fn write_piece(&mut self, index: usize, data: &[u8]) -> io::Result<()> {
        let start = index as u64 * self.piece_length;
        self.for_each_span(start, data.len(), |file, pos, range| {
            file.seek(SeekFrom::Start(pos))?;
            file.write_all(&data[range])
        })
    }

    fn read_piece(&mut self, index: usize, length: usize) -> io::Result<Vec<u8>> {
        let start = index as u64 * self.piece_length;
        let mut buf = vec![0u8; length];
        self.for_each_span(start, length, |file, pos, range| {
            file.seek(SeekFrom::Start(pos))?;
            file.read_exact(&mut buf[range])
        })?;
        Ok(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        for (_, file) in &mut self.files {
            file.sync_all()?;
        }
        Ok(())
    }
}

/// Keeps the whole content in memory
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    piece_length: usize,
    data: Vec<u8>,
}

impl MemoryStorage {
    pub fn new(piece_length: usize, total_size: usize) -> Self {
        Self {
            piece_length,
            data: vec![0; total_size],
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    fn range(&self, index: usize, length: usize) -> io::Result<std::ops::Range<usize>> {
        let start = index * self.piece_length;
        let end = start + length;
        if end > self.data.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("range {start}..{end} is outside of the torrent"),
            ));
        }
        Ok(start..end)
    }
}

impl Storage for MemoryStorage {
    fn write_piece(&mut self, index: usize, data: &[u8]) -> io::Result<()> {
        let range = self.range(index, data.len())?;
        self.data[range].copy_from_slice(data);
        Ok(())
    }

    fn read_piece(&mut self, index: usize, length: usize) -> io::Result<Vec<u8>> {
        let range = self.range(index, length)?;
        Ok(self.data[range].to_vec())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
