//! Positional file reads.
//!
//! Codeblock chunks are fetched with positional reads through a shared
//! file handle, so multiple worker threads can read concurrently without
//! seek races.

use std::fs::File;
use std::io;
use std::path::Path;

pub(crate) struct FileHandle {
    file: File,
    size: u64,
}

impl FileHandle {
    pub(crate) fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self { file, size })
    }

    #[inline]
    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    /// Read exactly `buf.len()` bytes at `offset`.
    pub(crate) fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            self.file.read_exact_at(buf, offset)
        }
        #[cfg(windows)]
        {
            use std::os::windows::fs::FileExt;

            use crate::error::bail;
            let mut read = 0usize;
            while read < buf.len() {
                let n = self.file.seek_read(&mut buf[read..], offset + read as u64)?;
                if n == 0 {
                    bail!(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "unexpected end of file",
                    ));
                }
                read += n;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::FileHandle;
    use std::io::Write;

    #[test]
    fn positional_reads_do_not_interfere() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"0123456789").unwrap();
        let handle = FileHandle::open(tmp.path()).unwrap();
        assert_eq!(handle.size(), 10);

        let mut a = [0u8; 4];
        let mut b = [0u8; 4];
        handle.read_at(&mut a, 6).unwrap();
        handle.read_at(&mut b, 0).unwrap();
        assert_eq!(&a, b"6789");
        assert_eq!(&b, b"0123");
    }

    #[test]
    fn short_read_is_an_error() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"abc").unwrap();
        let handle = FileHandle::open(tmp.path()).unwrap();
        let mut buf = [0u8; 8];
        assert!(handle.read_at(&mut buf, 0).is_err());
    }
}
