//! Byte sources for ingest: local files and remote archives.
//!
//! Remote opens issue a conditional range request so an interrupted
//! download can resume mid-file. The offset is honored only when the server
//! answers 206 and the entity tag still matches; everything else falls back
//! to a full download from byte zero.

use crate::error::SrakeError;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};

/// An open byte source plus what the origin told us about it.
pub struct ByteStream {
    reader: Box<dyn Read + Send>,
    /// Total entity length when known (file size, or Content-Length /
    /// Content-Range total for remote).
    pub content_length: Option<u64>,
    pub etag: Option<String>,
    /// Offset this stream starts at; non-zero only for a granted range.
    pub resumed_from: u64,
}

impl Read for ByteStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

pub fn open_local(path: &Path) -> crate::Result<ByteStream> {
    let file = File::open(path)?;
    let len = file.metadata()?.len();
    Ok(ByteStream {
        reader: Box::new(file),
        content_length: Some(len),
        etag: None,
        resumed_from: 0,
    })
}

/// Open `url`, optionally resuming at `resume_from` bytes.
pub fn open_remote(
    client: &reqwest::blocking::Client,
    url: &str,
    resume_from: u64,
    expected_etag: Option<&str>,
) -> crate::Result<ByteStream> {
    let mut request = client.get(url);
    if resume_from > 0 {
        request = request.header(reqwest::header::RANGE, format!("bytes={resume_from}-"));
        if let Some(etag) = expected_etag {
            request = request.header(reqwest::header::IF_RANGE, etag);
        }
    }

    let response = request.send().map_err(classify_reqwest_error)?;
    let status = response.status();

    if status.as_u16() == 416 {
        // Range no longer satisfiable; restart from zero.
        debug!(url, resume_from, "range not satisfiable, restarting download");
        return open_remote(client, url, 0, None);
    }
    if status.is_server_error() {
        return Err(SrakeError::NetworkTransient(format!("{url}: HTTP {status}")));
    }
    if status.is_client_error() {
        return Err(SrakeError::NetworkFatal(format!("{url}: HTTP {status}")));
    }

    let etag = header_str(&response, reqwest::header::ETAG);

    let (content_length, resumed_from) = if status.as_u16() == 206 {
        // ETag mismatch on a granted range is authoritative: restart.
        if let (Some(expected), Some(actual)) = (expected_etag, etag.as_deref()) {
            if expected != actual {
                warn!(url, expected, actual, "etag changed mid-source, restarting download");
                return open_remote(client, url, 0, None);
            }
        }
        let total = header_str(&response, reqwest::header::CONTENT_RANGE)
            .as_deref()
            .and_then(content_range_total);
        (total, resume_from)
    } else {
        // 200: the server ignored the range, full body from zero.
        (response.content_length(), 0)
    };

    Ok(ByteStream {
        reader: Box::new(response),
        content_length,
        etag,
        resumed_from,
    })
}

fn header_str(response: &reqwest::blocking::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Total length out of a `Content-Range: bytes 100-999/1000` header.
fn content_range_total(value: &str) -> Option<u64> {
    value.rsplit('/').next()?.trim().parse().ok()
}

fn classify_reqwest_error(err: reqwest::Error) -> SrakeError {
    if err.is_timeout() || err.is_connect() || err.is_body() || err.is_request() {
        SrakeError::NetworkTransient(err.to_string())
    } else {
        SrakeError::NetworkFatal(err.to_string())
    }
}

/// Whether an origin string names a remote archive.
pub fn is_remote(origin: &str) -> bool {
    origin.starts_with("http://") || origin.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_open_local_reports_length() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"0123456789").unwrap();
        let mut stream = open_local(file.path()).unwrap();
        assert_eq!(stream.content_length, Some(10));
        assert_eq!(stream.resumed_from, 0);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"0123456789");
    }

    #[test]
    fn test_content_range_total() {
        assert_eq!(content_range_total("bytes 100-999/1000"), Some(1000));
        assert_eq!(content_range_total("bytes 0-0/52"), Some(52));
        assert_eq!(content_range_total("bytes 0-0/*"), None);
    }

    #[test]
    fn test_is_remote() {
        assert!(is_remote("https://ftp.ncbi.nlm.nih.gov/sra/x.tar.gz"));
        assert!(!is_remote("/data/x.tar.gz"));
        assert!(!is_remote("x.tar.gz"));
    }
}
