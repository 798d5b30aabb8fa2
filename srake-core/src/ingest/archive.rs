//! Streaming gzip + tar decoding.
//!
//! The archive is consumed in a single pass: gzip window, one tar block,
//! and the current member's read buffer are the only resident state. Tar
//! members that are never read from are skipped by the underlying reader
//! when the iterator advances.

use flate2::read::GzDecoder;
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counts compressed bytes as they are pulled through, for progress and
/// resume offsets.
pub struct CountingReader<R> {
    inner: R,
    count: Arc<AtomicU64>,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared handle to the running byte count.
    pub fn counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.count)
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

/// Wrap a compressed byte source into a tar archive reader.
pub fn open_tar<R: Read>(reader: R) -> tar::Archive<GzDecoder<R>> {
    tar::Archive::new(GzDecoder::new(reader))
}

/// Whether a member path is an ingestible XML document.
pub fn is_xml_member(path: &str) -> bool {
    std::path::Path::new(path)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("xml"))
}

/// Whether an IO error came from corrupt compressed data (bad CRC,
/// truncated deflate stream) rather than the transport.
pub fn is_corruption(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::InvalidData | std::io::ErrorKind::UnexpectedEof
    )
}
