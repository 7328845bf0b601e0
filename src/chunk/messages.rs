//! Chunk channel message headers.

use std::fmt;

use crate::utils::DfsError;

/// Longest filename accepted anywhere in the system, in bytes.
const MAX_FILENAME_LEN: usize = 255;

/// Checks that a filename is usable both inside header grammars (it must not
/// contain any field separator) and as a node-side storage key.
pub fn validate_filename(filename: &str) -> Result<(), DfsError> {
    if filename.is_empty() {
        return Err(DfsError::msg("empty filename"));
    }
    if filename.len() > MAX_FILENAME_LEN {
        return Err(DfsError::msg(format!(
            "filename longer than {} bytes",
            MAX_FILENAME_LEN
        )));
    }
    if filename == "." || filename == ".." {
        return Err(DfsError::msg(format!("invalid filename '{}'", filename)));
    }
    if filename.contains("||") || filename.contains("::") {
        return Err(DfsError::msg(format!(
            "filename '{}' contains a field separator",
            filename
        )));
    }
    if filename
        .chars()
        .any(|c| matches!(c, '/' | '\\' | '\0' | '\n' | '\r'))
    {
        return Err(DfsError::msg(format!(
            "filename {:?} contains a forbidden character",
            filename
        )));
    }
    Ok(())
}

/// Request from the master to a storage node's chunk server.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ChunkRequest {
    /// Store `len` bytes (following the header) as chunk `index` of file
    /// `filename`, overwriting any previous copy.
    Store {
        filename: String,
        index: usize,
        len: usize,
    },

    /// Get chunk `index` of file `filename`.
    Get { filename: String, index: usize },
}

impl ChunkRequest {
    /// Parses a header line (without its terminator).
    pub fn parse(line: &str) -> Result<Self, DfsError> {
        if let Some(rest) = line.strip_prefix("STORE||") {
            let mut fields = rest.rsplitn(3, "||");
            let (len, index, filename) =
                match (fields.next(), fields.next(), fields.next()) {
                    (Some(len), Some(index), Some(filename)) => {
                        (len, index, filename)
                    }
                    _ => {
                        return Err(DfsError::msg(format!(
                            "malformed STORE header '{}'",
                            line
                        )))
                    }
                };
            validate_filename(filename)?;
            Ok(ChunkRequest::Store {
                filename: filename.into(),
                index: index.parse()?,
                len: len.parse()?,
            })
        } else if let Some(rest) = line.strip_prefix("GET||") {
            let (filename, index) = rest.rsplit_once("||").ok_or_else(|| {
                DfsError::msg(format!("malformed GET header '{}'", line))
            })?;
            validate_filename(filename)?;
            Ok(ChunkRequest::Get {
                filename: filename.into(),
                index: index.parse()?,
            })
        } else {
            Err(DfsError::msg(format!("unknown chunk request '{}'", line)))
        }
    }
}

impl fmt::Display for ChunkRequest {
    /// Formats the header line, without terminator.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChunkRequest::Store {
                filename,
                index,
                len,
            } => write!(f, "STORE||{}||{}||{}", filename, index, len),
            ChunkRequest::Get { filename, index } => {
                write!(f, "GET||{}||{}", filename, index)
            }
        }
    }
}

/// Reply from a storage node's chunk server.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ChunkReply {
    /// Chunk stored.
    Stored,

    /// Chunk could not be stored.
    Failed,

    /// Size of the chunk whose bytes follow; 0 means not present.
    Size(usize),
}

impl ChunkReply {
    /// Parses a reply line (without its terminator).
    pub fn parse(line: &str) -> Result<Self, DfsError> {
        match line {
            "OK" => Ok(ChunkReply::Stored),
            "ERROR" => Ok(ChunkReply::Failed),
            _ => match line.strip_prefix("SIZE::") {
                Some(n) => Ok(ChunkReply::Size(n.parse()?)),
                None => {
                    Err(DfsError::msg(format!("unknown chunk reply '{}'", line)))
                }
            },
        }
    }
}

impl fmt::Display for ChunkReply {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChunkReply::Stored => write!(f, "OK"),
            ChunkReply::Failed => write!(f, "ERROR"),
            ChunkReply::Size(n) => write!(f, "SIZE::{}", n),
        }
    }
}
