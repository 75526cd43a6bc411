//! Fixed-size page I/O.
//!
//! A `.db`/`.idx` file is a sequence of `page_size`-byte pages addressed by
//! zero-based page number. Every page holds exactly one logical object,
//! encoded with `bincode` and right-padded with zero bytes. A page whose
//! bytes are entirely zero is indistinguishable from "never written" and is
//! reported as absent — this is how a freshly `next_page`-allocated page
//! reads before its first write.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Error, Result};

pub struct PageFile {
    path: PathBuf,
    file: File,
    page_size: usize,
}

impl PageFile {
    /// Opens `path`, creating an empty file if it does not exist yet.
    pub fn open(path: impl AsRef<Path>, page_size: usize) -> Result<PageFile> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        Ok(PageFile {
            path,
            file,
            page_size,
        })
    }

    pub fn exists(path: impl AsRef<Path>) -> bool {
        path.as_ref().is_file()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the raw bytes of `page_num`. Returns `Ok(None)` if the page is
    /// all-zero (including "past the end of the file", which reads as
    /// all-zero for our purposes).
    pub fn read_raw(&mut self, page_num: u32) -> Result<Option<Vec<u8>>> {
        let offset = page_num as u64 * self.page_size as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; self.page_size];
        let mut filled = 0usize;
        loop {
            let n = self.file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
            if filled == buf.len() {
                break;
            }
        }
        // Bytes past EOF stay zero-initialized, which is exactly the
        // "page never written" representation.
        if buf.iter().all(|b| *b == 0) {
            Ok(None)
        } else {
            Ok(Some(buf))
        }
    }

    /// Writes `bytes` (already encoded and padded to `page_size`) to
    /// `page_num`, flushing to disk before returning.
    pub fn write_raw(&mut self, page_num: u32, bytes: &[u8]) -> Result<()> {
        debug_assert_eq!(bytes.len(), self.page_size);
        let offset = page_num as u64 * self.page_size as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(bytes)?;
        self.file.sync_data()?;
        Ok(())
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }
}

/// Encodes `obj` and right-pads it to exactly `page_size` bytes. Fails if the
/// encoded form does not fit.
pub fn encode_page<T: Serialize>(obj: &T, page_size: usize) -> Result<Vec<u8>> {
    let mut bytes = bincode::serialize(obj)?;
    if bytes.len() > page_size {
        return Err(Error::Encoding(Box::new(bincode::ErrorKind::SizeLimit)));
    }
    bytes.resize(page_size, 0);
    Ok(bytes)
}

/// Decodes a logical object from a page's raw bytes (trailing zero padding
/// is simply left unread).
pub fn decode_page<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Dummy {
        a: u32,
        b: String,
    }

    #[test]
    fn round_trips_within_one_page() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        let mut pf = PageFile::open(&path, 4096).unwrap();

        assert_eq!(pf.read_raw(0).unwrap(), None);

        let obj = Dummy {
            a: 7,
            b: "hello".to_string(),
        };
        let bytes = encode_page(&obj, 4096).unwrap();
        pf.write_raw(0, &bytes).unwrap();

        let back = pf.read_raw(0).unwrap().unwrap();
        let decoded: Dummy = decode_page(&back).unwrap();
        assert_eq!(decoded, obj);
    }

    #[test]
    fn unwritten_page_past_eof_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        let mut pf = PageFile::open(&path, 4096).unwrap();
        assert_eq!(pf.read_raw(5).unwrap(), None);
    }
}
