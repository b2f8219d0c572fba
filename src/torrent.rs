use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::info;

use crate::bencode::{self, Value};
use crate::error::ApplicationError;

/// Represents a parsed .torrent file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Torrent {
    pub announce: String,
    pub info:     Info,
    #[serde(skip)]
    info_hash:    [u8; 20],
}

/// Fields inside the 'info' dictionary of a .torrent file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(rename = "piece length")]
    pub piece_length: i64,
    pub pieces: ByteBuf,
    pub length: Option<i64>,
    pub files:  Option<Vec<TorrentFile>>,
}

/// A file entry in a multi-file torrent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorrentFile {
    pub length: i64,
    pub path:   Vec<String>,
}

/// A file of the torrent placed on the flat byte range of its content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path:   PathBuf,
    pub length: u64,
    /// Offset of the first byte of this file in the torrent content
    pub offset: u64,
}

impl FileEntry {
    /// The path stays below whatever directory it is joined to
    pub fn is_contained(&self) -> bool {
        !self.path.components().any(|c| {
            matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_))
        })
    }
}

impl Torrent {
    /// Reads a `.torrent` file from disk and parses it into a [`Torrent`]
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ApplicationError> {
        let data = fs::read(path.as_ref()).map_err(|e| {
            ApplicationError::FormatError(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::from_bytes(&data)
    }

    /// Parses bencoded metainfo and validates its piece layout
    pub fn from_bytes(data: &[u8]) -> Result<Self, ApplicationError> {
        // The info hash must be computed over the info dictionary as a whole,
        // including keys we do not model
        let raw: BTreeMap<String, Value> = bencode::decode(data)?;
        let info_value = raw
            .get("info")
            .ok_or_else(|| ApplicationError::FormatError("missing info".into()))?;
        let info_raw_bytes = bencode::encode(info_value)?;

        let mut torrent: Torrent = bencode::decode(data)?;
        torrent.info_hash.copy_from_slice(&Sha1::digest(&info_raw_bytes));
        torrent.validate()?;
        Ok(torrent)
    }

    fn validate(&self) -> Result<(), ApplicationError> {
        if self.info.piece_length <= 0 {
            return Err(ApplicationError::FormatError(format!(
                "invalid piece length {}",
                self.info.piece_length
            )));
        }
        if self.info.pieces.len() % 20 != 0 {
            return Err(ApplicationError::FormatError(
                "pieces is not a multiple of 20 bytes".into(),
            ));
        }
        if self.info.length.is_none() && self.info.files.is_none() {
            return Err(ApplicationError::FormatError(
                "info has neither length nor files".into(),
            ));
        }
        let lengths = self
            .info
            .files
            .iter()
            .flatten()
            .map(|f| f.length)
            .chain(self.info.length);
        for length in lengths {
            if length < 0 {
                return Err(ApplicationError::FormatError(format!(
                    "negative file length {length}"
                )));
            }
        }

        if let Some(entry) = self.files().iter().find(|f| !f.is_contained()) {
            return Err(ApplicationError::FormatError(format!(
                "file path {} leaves the download directory",
                entry.path.display()
            )));
        }

        let expected = self.total_size().div_ceil(self.piece_length());
        if expected != self.pieces_count() as u64 {
            return Err(ApplicationError::FormatError(format!(
                "torrent declares {} piece hashes but its size needs {}",
                self.pieces_count(),
                expected
            )));
        }
        Ok(())
    }

    /// SHA1 hash of the bencoded `info` dictionary
    pub fn info_hash(&self) -> [u8; 20] {
        self.info_hash
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Calculates the total size of all files described by the torrent
    pub fn total_size(&self) -> u64 {
        self.files().iter().map(|f| f.length).sum()
    }

    /// Returns all files in the torrent with their paths, sizes and offsets
    pub fn files(&self) -> Vec<FileEntry> {
        if let Some(files) = &self.info.files {
            let mut offset = 0;
            files
                .iter()
                .map(|f| {
                    let mut path = PathBuf::from(&self.info.name);
                    path.extend(&f.path);
                    let entry = FileEntry {
                        path,
                        length: f.length as u64,
                        offset,
                    };
                    offset += entry.length;
                    entry
                })
                .collect()
        } else {
            vec![FileEntry {
                path:   PathBuf::from(&self.info.name),
                length: self.info.length.unwrap_or(0) as u64,
                offset: 0,
            }]
        }
    }

    /// Returns the number of pieces the torrent is divided into
    pub fn pieces_count(&self) -> usize {
        self.info.pieces.len() / 20
    }

    /// Returns the declared length of each piece (in bytes)
    ///
    /// The last piece may be shorter.
    pub fn piece_length(&self) -> u64 {
        self.info.piece_length as u64
    }

    /// Returns the SHA1 hash of each piece
    pub fn piece_hashes(&self) -> Vec<[u8; 20]> {
        self.info
            .pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut arr = [0u8; 20];
                arr.copy_from_slice(chunk);
                arr
            })
            .collect()
    }

    pub fn log_info(&self) {
        info!(
            name = %self.info.name,
            announce = %self.announce,
            info_hash = %hex::encode(self.info_hash),
            piece_length = self.piece_length(),
            pieces = self.pieces_count(),
            total_size = self.total_size(),
            "loaded torrent"
        );
        for file in self.files() {
            info!(path = %file.path.display(), length = file.length, "torrent file");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use super::*;

    fn bytes(s: &str) -> Value {
        Value::Bytes(s.as_bytes().to_vec())
    }

    fn metainfo(info: HashMap<Vec<u8>, Value>) -> Vec<u8> {
        let mut meta = HashMap::new();
        meta.insert(b"announce".to_vec(), bytes("http://tracker.test/announce"));
        meta.insert(b"info".to_vec(), Value::Dict(info));
        bencode::encode(&Value::Dict(meta)).unwrap()
    }

    /// Builds a single-file metainfo whose hashes match `content`
    pub(crate) fn single_file(content: &[u8], piece_length: usize) -> Vec<u8> {
        let pieces: Vec<u8> = content
            .chunks(piece_length)
            .flat_map(|chunk| Sha1::digest(chunk).to_vec())
            .collect();

        let mut info = HashMap::new();
        info.insert(b"name".to_vec(), bytes("sample.bin"));
        info.insert(b"piece length".to_vec(), Value::Int(piece_length as i64));
        info.insert(b"pieces".to_vec(), Value::Bytes(pieces));
        info.insert(b"length".to_vec(), Value::Int(content.len() as i64));
        metainfo(info)
    }

    #[test]
    fn parses_single_file_torrent() {
        let content = vec![7u8; 42768];
        let torrent = Torrent::from_bytes(&single_file(&content, 32768)).unwrap();

        assert_eq!(torrent.announce, "http://tracker.test/announce");
        assert_eq!(torrent.name(), "sample.bin");
        assert_eq!(torrent.total_size(), 42768);
        assert_eq!(torrent.piece_length(), 32768);
        assert_eq!(torrent.pieces_count(), 2);
        assert_eq!(
            torrent.piece_hashes()[1].as_slice(),
            Sha1::digest(&content[32768..]).as_slice()
        );
    }

    #[test]
    fn info_hash_covers_the_whole_info_dictionary() {
        let data = single_file(&[1u8; 100], 64);
        let torrent = Torrent::from_bytes(&data).unwrap();

        let raw: BTreeMap<String, Value> = bencode::decode(&data).unwrap();
        let info = bencode::encode(&raw["info"]).unwrap();
        assert_eq!(torrent.info_hash().as_slice(), Sha1::digest(&info).as_slice());
    }

    #[test]
    fn multi_file_offsets_are_contiguous() {
        let file = |len: i64, path: &[&str]| {
            let mut f = HashMap::new();
            f.insert(b"length".to_vec(), Value::Int(len));
            f.insert(
                b"path".to_vec(),
                Value::List(path.iter().map(|p| bytes(p)).collect()),
            );
            Value::Dict(f)
        };

        let mut info = HashMap::new();
        info.insert(b"name".to_vec(), bytes("album"));
        info.insert(b"piece length".to_vec(), Value::Int(16));
        info.insert(b"pieces".to_vec(), Value::Bytes(vec![0; 40]));
        info.insert(
            b"files".to_vec(),
            Value::List(vec![file(10, &["a.txt"]), file(20, &["disc", "b.txt"])]),
        );

        let torrent = Torrent::from_bytes(&metainfo(info)).unwrap();
        let files = torrent.files();
        assert_eq!(torrent.total_size(), 30);
        assert_eq!(files[0].path, PathBuf::from("album/a.txt"));
        assert_eq!(files[0].offset, 0);
        assert_eq!(files[1].path, PathBuf::from("album/disc/b.txt"));
        assert_eq!(files[1].offset, 10);
    }

    #[test]
    fn rejects_paths_leaving_the_download_directory() {
        let escaping = |name: &str, path: &[&str]| {
            let mut f = HashMap::new();
            f.insert(b"length".to_vec(), Value::Int(10));
            f.insert(
                b"path".to_vec(),
                Value::List(path.iter().map(|p| bytes(p)).collect()),
            );
            let mut info = HashMap::new();
            info.insert(b"name".to_vec(), bytes(name));
            info.insert(b"piece length".to_vec(), Value::Int(16));
            info.insert(b"pieces".to_vec(), Value::Bytes(vec![0; 20]));
            info.insert(b"files".to_vec(), Value::List(vec![Value::Dict(f)]));
            Torrent::from_bytes(&metainfo(info))
        };

        assert!(matches!(
            escaping("album", &["..", "..", "escaped.bin"]),
            Err(ApplicationError::FormatError(_))
        ));
        assert!(matches!(
            escaping("/tmp", &["escaped.bin"]),
            Err(ApplicationError::FormatError(_))
        ));
        assert!(escaping("album", &["disc", "ok.bin"]).is_ok());
    }

    #[test]
    fn rejects_mismatched_piece_count() {
        let mut info = HashMap::new();
        info.insert(b"name".to_vec(), bytes("short.bin"));
        info.insert(b"piece length".to_vec(), Value::Int(64));
        // 100 bytes need two pieces
        info.insert(b"pieces".to_vec(), Value::Bytes(vec![0; 20]));
        info.insert(b"length".to_vec(), Value::Int(100));

        let res = Torrent::from_bytes(&metainfo(info));
        assert!(matches!(res, Err(ApplicationError::FormatError(_))));
    }

    #[test]
    fn rejects_missing_info() {
        let res = Torrent::from_bytes(b"d8:announce3:urle");
        assert!(matches!(res, Err(ApplicationError::FormatError(_))));
    }
}
