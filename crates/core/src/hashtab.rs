// crates/core/src/hashtab.rs
//! Hashtab descriptor parsing.
//!
//! A hashtab maps QML identifier hashes back to their strings for one
//! device on one OS version. The registry only needs the descriptor (who
//! the file is for and how big it is), so entries are counted but not kept.
//!
//! ```text
//! magic[8]              "QMDHTAB1" (hashtab) | "QMDHLST1" (hashlist)
//! u16 LE + bytes        OS version, UTF-8
//! u16 LE + bytes        device, UTF-8
//! entries until EOF     hashtab:  u64 LE hash, u32 LE len, bytes
//!                       hashlist: u64 LE hash
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Serialize;

use crate::error::{EncodeError, ParseError};

const HASHTAB_MAGIC: &[u8; 8] = b"QMDHTAB1";
const HASHLIST_MAGIC: &[u8; 8] = b"QMDHLST1";

/// Whether a file carries the strings for each hash or only the hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HashtabFormat {
    Hashtab,
    Hashlist,
}

impl HashtabFormat {
    fn magic(self) -> &'static [u8; 8] {
        match self {
            HashtabFormat::Hashtab => HASHTAB_MAGIC,
            HashtabFormat::Hashlist => HASHLIST_MAGIC,
        }
    }
}

impl fmt::Display for HashtabFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashtabFormat::Hashtab => write!(f, "hashtab (with strings)"),
            HashtabFormat::Hashlist => write!(f, "hashlist (hash-only)"),
        }
    }
}

/// Descriptor of one device hashtab on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hashtab {
    /// Base file name; unique across the registry.
    pub name: String,
    pub path: PathBuf,
    pub version: String,
    pub device: String,
    pub format: HashtabFormat,
    pub entry_count: usize,
    pub mod_time: SystemTime,
}

impl Hashtab {
    /// Read and parse the hashtab at `path`.
    pub fn load(path: &Path) -> Result<Self, ParseError> {
        let bytes = std::fs::read(path).map_err(|e| ParseError::io(path, e))?;
        let mod_time = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .map_err(|e| ParseError::io(path, e))?;
        Self::parse(path, &bytes, mod_time)
    }

    /// Parse an in-memory hashtab image.
    pub fn parse(path: &Path, bytes: &[u8], mod_time: SystemTime) -> Result<Self, ParseError> {
        let mut cur = Cursor { path, bytes, pos: 0 };

        let format = match cur.take(8, "magic")? {
            m if m == HASHTAB_MAGIC => HashtabFormat::Hashtab,
            m if m == HASHLIST_MAGIC => HashtabFormat::Hashlist,
            _ => {
                return Err(ParseError::BadMagic {
                    path: path.to_path_buf(),
                })
            }
        };

        let version = cur.string("version")?;
        let device = cur.string("device")?;

        let mut entry_count = 0;
        while !cur.at_end() {
            cur.take(8, "entry hash")?;
            if format == HashtabFormat::Hashtab {
                let len = cur.u32("entry length")? as usize;
                cur.take(len, "entry string")?;
            }
            entry_count += 1;
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Self {
            name,
            path: path.to_path_buf(),
            version,
            device,
            format,
            entry_count,
            mod_time,
        })
    }

    /// Serialize a hashtab image. Hashlists drop the strings.
    pub fn encode(
        format: HashtabFormat,
        version: &str,
        device: &str,
        entries: &[(u64, &str)],
    ) -> Result<Vec<u8>, EncodeError> {
        let mut out = Vec::with_capacity(64 + entries.len() * 16);
        out.extend_from_slice(format.magic());
        for (field, value) in [("version", version), ("device", device)] {
            let len = u16::try_from(value.len()).map_err(|_| EncodeError {
                field,
                len: value.len(),
                max: u16::MAX as usize,
            })?;
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(value.as_bytes());
        }
        for (hash, s) in entries {
            out.extend_from_slice(&hash.to_le_bytes());
            if format == HashtabFormat::Hashtab {
                let len = u32::try_from(s.len()).map_err(|_| EncodeError {
                    field: "entry string",
                    len: s.len(),
                    max: u32::MAX as usize,
                })?;
                out.extend_from_slice(&len.to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
        }
        Ok(out)
    }

    pub fn is_hashlist(&self) -> bool {
        self.format == HashtabFormat::Hashlist
    }
}

struct Cursor<'a> {
    path: &'a Path,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn take(&mut self, n: usize, context: &'static str) -> Result<&'a [u8], ParseError> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.bytes.len());
        match end {
            Some(end) => {
                let slice = &self.bytes[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(ParseError::Truncated {
                path: self.path.to_path_buf(),
                context,
            }),
        }
    }

    fn u16(&mut self, context: &'static str) -> Result<u16, ParseError> {
        let b = self.take(2, context)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, context: &'static str) -> Result<u32, ParseError> {
        let b = self.take(4, context)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn string(&mut self, field: &'static str) -> Result<String, ParseError> {
        let len = self.u16(field)? as usize;
        let raw = self.take(len, field)?;
        let s = std::str::from_utf8(raw).map_err(|_| ParseError::InvalidUtf8 {
            path: self.path.to_path_buf(),
            field,
        })?;
        if s.trim().is_empty() {
            return Err(ParseError::EmptyField {
                path: self.path.to_path_buf(),
                field,
            });
        }
        Ok(s.to_string())
    }
}
