//! Byte sources consumed during construction, plus the pre/postread metadata
//! they contribute to each node.

use crate::node::{NodeId, Tree};
use crate::value::Value;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("end of input at offset {offset} (wanted {wanted} more bytes)")]
    EndOfInput { offset: u64, wanted: usize },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A stream of bytes with a current position. Sources also decorate nodes
/// with positional metadata before and after their bytes are read.
pub trait Source {
    /// Read exactly `n` bytes. On `EndOfInput` the position is unchanged.
    fn read(&mut self, n: usize) -> Result<Vec<u8>, SourceError>;

    fn position(&self) -> u64;

    fn preread_metadata(&self, _tree: &Tree, _node: NodeId) -> Vec<(String, Value)> {
        vec![("start_offset".to_string(), Value::Int(self.position() as i64))]
    }

    fn postread_metadata(&self, tree: &Tree, node: NodeId) -> Vec<(String, Value)> {
        let end = self.position() as i64;
        let mut out = vec![("end_offset".to_string(), Value::Int(end))];
        if let Some(Value::Int(start)) = tree.metadata(node, "start_offset") {
            out.push(("length".to_string(), Value::Int(end - start)));
        }
        out
    }
}

/// In-memory source over an owned byte buffer.
pub struct SliceSource {
    data: Vec<u8>,
    pos: usize,
}

impl SliceSource {
    pub fn new(data: impl Into<Vec<u8>>) -> SliceSource {
        SliceSource { data: data.into(), pos: 0 }
    }
}

impl Source for SliceSource {
    fn read(&mut self, n: usize) -> Result<Vec<u8>, SourceError> {
        if self.pos + n > self.data.len() {
            return Err(SourceError::EndOfInput { offset: self.pos as u64, wanted: n });
        }
        let out = self.data[self.pos..self.pos + n].to_vec();
        self.pos += n;
        Ok(out)
    }

    fn position(&self) -> u64 {
        self.pos as u64
    }
}

/// Buffered file source; additionally records the file path as `source`
/// metadata on each node.
pub struct FileSource {
    path: PathBuf,
    reader: BufReader<File>,
    pos: u64,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<FileSource, SourceError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        Ok(FileSource { path, reader: BufReader::new(file), pos: 0 })
    }
}

impl Source for FileSource {
    fn read(&mut self, n: usize) -> Result<Vec<u8>, SourceError> {
        let mut buf = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            let got = self.reader.read(&mut buf[filled..])?;
            if got == 0 {
                return Err(SourceError::EndOfInput {
                    offset: self.pos,
                    wanted: n - filled,
                });
            }
            filled += got;
        }
        self.pos += n as u64;
        Ok(buf)
    }

    fn position(&self) -> u64 {
        self.pos
    }

    fn preread_metadata(&self, _tree: &Tree, _node: NodeId) -> Vec<(String, Value)> {
        vec![
            ("source".to_string(), Value::Str(self.path.display().to_string())),
            ("start_offset".to_string(), Value::Int(self.pos as i64)),
        ]
    }
}
