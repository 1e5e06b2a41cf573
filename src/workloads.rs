//! Sample work functions and the byte-range reader seam
//!
//! The harness itself knows nothing about payloads. These are the pieces the
//! demos and benches plug into it: a prime counter over a numeric range and a
//! max-byte scan over a byte range of some resource.

use crate::harness::WorkerContext;
use crate::partition::Chunk;
use anyhow::{bail, Context};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Random-access reader over a file or remote resource
pub trait ByteRangeReader: Sync {
    /// Total size in bytes
    fn size(&self) -> anyhow::Result<u64>;

    /// Read up to `len` bytes starting at `offset`
    fn read(&self, offset: u64, len: u64) -> anyhow::Result<Vec<u8>>;
}

/// Reader over a local file; every read opens its own handle
///
/// Holding only the path keeps the reader valid in forked children, which
/// must not share a file cursor with the parent.
#[derive(Debug, Clone)]
pub struct FileRangeReader {
    path: PathBuf,
}

impl FileRangeReader {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl ByteRangeReader for FileRangeReader {
    fn size(&self) -> anyhow::Result<u64> {
        let meta = std::fs::metadata(&self.path)
            .with_context(|| format!("stat {}", self.path.display()))?;
        Ok(meta.len())
    }

    fn read(&self, offset: u64, len: u64) -> anyhow::Result<Vec<u8>> {
        let mut file =
            File::open(&self.path).with_context(|| format!("open {}", self.path.display()))?;
        file.seek(SeekFrom::Start(offset))
            .with_context(|| format!("seek to {} in {}", offset, self.path.display()))?;
        let mut data = Vec::with_capacity(len as usize);
        file.take(len)
            .read_to_end(&mut data)
            .with_context(|| format!("read {} bytes at {}", len, offset))?;
        Ok(data)
    }
}

/// Largest byte in the chunk's range of `reader`
pub fn max_byte_in_range<R: ByteRangeReader + ?Sized>(reader: &R, chunk: &Chunk) -> anyhow::Result<u8> {
    let data = reader.read(chunk.offset, chunk.len)?;
    match data.iter().max() {
        Some(max) => Ok(*max),
        None => bail!("chunk {} read no bytes at offset {}", chunk.index, chunk.offset),
    }
}

/// Number of primes in the chunk's range
///
/// Stops early with an error if the run is cancelled, so a timed-out thread
/// invocation does not keep burning CPU.
pub fn count_primes(chunk: &Chunk, ctx: &WorkerContext) -> anyhow::Result<u64> {
    let mut count = 0;
    for (i, n) in chunk.range().enumerate() {
        if i % 4096 == 0 && ctx.is_cancelled() {
            bail!("cancelled after {} numbers", i);
        }
        if is_prime(n) {
            count += 1;
        }
    }
    Ok(count)
}

/// 6k ± 1 trial division
pub fn is_prime(n: u64) -> bool {
    if n <= 1 {
        return false;
    }
    if n <= 3 {
        return true;
    }
    if n % 2 == 0 || n % 3 == 0 {
        return false;
    }
    let mut i = 5;
    while i * i <= n {
        if n % i == 0 || n % (i + 2) == 0 {
            return false;
        }
        i += 6;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Backend;
    use crate::harness::CancellationToken;
    use std::io::Write;

    #[test]
    fn test_is_prime() {
        let primes: Vec<u64> = (0..30).filter(|&n| is_prime(n)).collect();
        assert_eq!(primes, vec![2, 3, 5, 7, 11, 13, 17, 19, 23, 29]);
        assert!(is_prime(7919));
        assert!(!is_prime(7917));
    }

    #[test]
    fn test_count_primes() {
        let ctx = WorkerContext::new(
            0,
            Backend::Threaded,
            CancellationToken::new(),
            CancellationToken::new(),
        );
        assert_eq!(count_primes(&Chunk::new(0, 0, 100), &ctx).unwrap(), 25);
    }

    #[test]
    fn test_count_primes_stops_when_cancelled() {
        let caller = CancellationToken::new();
        caller.cancel();
        let ctx = WorkerContext::new(0, Backend::Threaded, caller, CancellationToken::new());
        assert!(count_primes(&Chunk::new(0, 0, 100), &ctx).is_err());
    }

    #[test]
    fn test_file_reader_ranges() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[1, 9, 3, 4, 250, 6]).unwrap();
        let reader = FileRangeReader::new(file.path());

        assert_eq!(reader.size().unwrap(), 6);
        assert_eq!(reader.read(1, 2).unwrap(), vec![9, 3]);
        assert_eq!(reader.read(5, 10).unwrap(), vec![6]);
        assert_eq!(max_byte_in_range(&reader, &Chunk::new(0, 0, 3)).unwrap(), 9);
        assert_eq!(max_byte_in_range(&reader, &Chunk::new(1, 3, 3)).unwrap(), 250);
    }

    #[test]
    fn test_max_byte_empty_read_fails() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let reader = FileRangeReader::new(file.path());
        assert!(max_byte_in_range(&reader, &Chunk::new(0, 0, 4)).is_err());
    }

    #[test]
    fn test_missing_file_has_context() {
        let reader = FileRangeReader::new("/nonexistent/chunkpool-data.dat");
        let err = reader.read(0, 1).unwrap_err();
        assert!(format!("{:#}", err).contains("open /nonexistent/chunkpool-data.dat"));
    }
}
