//! The single-file-per-capture binary format.
//!
//! ```text
//! "\x7Fcap 01\n"
//! <original_url> "\n"
//! <final_url> "\n"
//! <coarse_status> "\n"
//! <fine_detail> "\n"
//! <elapsed_seconds> "\n"
//! <content_len_bytes> " " <log_len_bytes> "\n"
//! <zlib(utf8(html))>
//! <zlib(utf8(har_json))>
//! ```
//!
//! Version 00 differs in the trailing log (a custom format rather than HAR)
//! and stored empty content as zero bytes; version 01 always stores the zlib
//! of the empty string. Writers emit 01; readers accept both.

use std::io::{BufRead, BufReader, Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use thiserror::Error;

const MAGIC_V01: &[u8] = b"\x7Fcap 01\n";
const MAGIC_V00: &[u8] = b"\x7Fcap 00\n";

#[derive(Debug, Error)]
pub enum CaptureFormatError {
    #[error("not a capture file (bad magic)")]
    BadMagic,
    #[error("malformed capture header: {0}")]
    BadHeader(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One capture of one URL from one vantage point.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRecord {
    pub original_url: String,
    pub final_url: String,
    pub coarse: String,
    pub detail: String,
    pub elapsed: f64,
    pub html: String,
    /// HAR JSON in version 01; an opaque legacy log in version 00.
    pub log: String,
}

fn zlib(data: &[u8]) -> Vec<u8> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).expect("writing to a Vec");
    enc.finish().expect("finishing zlib stream to a Vec")
}

fn unzlib(data: &[u8]) -> Result<String, CaptureFormatError> {
    if data.is_empty() {
        // Version 00 stored empty content as zero bytes.
        return Ok(String::new());
    }
    let mut out = String::new();
    ZlibDecoder::new(data).read_to_string(&mut out)?;
    Ok(out)
}

/// Write one capture in version-01 format.
pub fn write_capture(w: &mut impl Write, rec: &CaptureRecord) -> std::io::Result<()> {
    let content = zlib(rec.html.as_bytes());
    let log = zlib(rec.log.as_bytes());

    w.write_all(MAGIC_V01)?;
    for line in [
        rec.original_url.as_str(),
        rec.final_url.as_str(),
        rec.coarse.as_str(),
        rec.detail.as_str(),
    ] {
        w.write_all(line.as_bytes())?;
        w.write_all(b"\n")?;
    }
    writeln!(w, "{}", rec.elapsed)?;
    writeln!(w, "{} {}", content.len(), log.len())?;
    w.write_all(&content)?;
    w.write_all(&log)?;
    Ok(())
}

/// Read one capture, accepting version 00 or 01.
pub fn read_capture(r: &mut impl Read) -> Result<CaptureRecord, CaptureFormatError> {
    let mut reader = BufReader::new(r);

    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if magic != MAGIC_V01 && magic != MAGIC_V00 {
        return Err(CaptureFormatError::BadMagic);
    }

    let mut line = |what: &str| -> Result<String, CaptureFormatError> {
        let mut buf = String::new();
        if reader.read_line(&mut buf)? == 0 {
            return Err(CaptureFormatError::BadHeader(format!("missing {}", what)));
        }
        Ok(buf.trim_end_matches('\n').to_string())
    };

    let original_url = line("original url")?;
    let final_url = line("final url")?;
    let coarse = line("coarse status")?;
    let detail = line("fine detail")?;
    let elapsed: f64 = line("elapsed seconds")?
        .parse()
        .map_err(|e| CaptureFormatError::BadHeader(format!("elapsed: {}", e)))?;

    let lengths = line("length header")?;
    let mut parts = lengths.split(' ');
    let parse_len = |part: Option<&str>| -> Result<usize, CaptureFormatError> {
        part.and_then(|p| p.parse().ok())
            .ok_or_else(|| CaptureFormatError::BadHeader(format!("lengths: {:?}", lengths)))
    };
    let content_len = parse_len(parts.next())?;
    let log_len = parse_len(parts.next())?;

    let mut content = vec![0u8; content_len];
    reader.read_exact(&mut content)?;
    let mut log = vec![0u8; log_len];
    reader.read_exact(&mut log)?;

    Ok(CaptureRecord {
        original_url,
        final_url,
        coarse,
        detail,
        elapsed,
        html: unzlib(&content)?,
        log: unzlib(&log)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> CaptureRecord {
        CaptureRecord {
            original_url: "http://example.com/".to_string(),
            final_url: "https://example.com/home".to_string(),
            coarse: "ok".to_string(),
            detail: "200 OK".to_string(),
            elapsed: 3.25,
            html: "<html><body>captured</body></html>".to_string(),
            log: r#"{"log":{"version":"1.2","entries":[]}}"#.to_string(),
        }
    }

    #[test]
    fn roundtrip_v01() {
        let mut buf = Vec::new();
        write_capture(&mut buf, &record()).unwrap();
        assert!(buf.starts_with(MAGIC_V01));

        let back = read_capture(&mut buf.as_slice()).unwrap();
        assert_eq!(back, record());
    }

    #[test]
    fn empty_content_is_zlib_of_empty_string() {
        let rec = CaptureRecord {
            html: String::new(),
            ..record()
        };
        let mut buf = Vec::new();
        write_capture(&mut buf, &rec).unwrap();

        // The content length field is nonzero: version 01 never stores
        // zero-byte content.
        let header = String::from_utf8_lossy(&buf[..buf.len().min(200)]).to_string();
        let lengths_line = header.lines().nth(6).unwrap();
        let content_len: usize = lengths_line.split(' ').next().unwrap().parse().unwrap();
        assert!(content_len > 0);

        let back = read_capture(&mut buf.as_slice()).unwrap();
        assert_eq!(back.html, "");
    }

    #[test]
    fn reads_v00_with_zero_byte_content() {
        let log = {
            let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
            enc.write_all(b"legacy log").unwrap();
            enc.finish().unwrap()
        };
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC_V00);
        buf.extend_from_slice(b"http://example.com/\n");
        buf.extend_from_slice(b"http://example.com/\n");
        buf.extend_from_slice(b"crawler failure\n");
        buf.extend_from_slice(b"connection refused\n");
        buf.extend_from_slice(b"1.5\n");
        buf.extend_from_slice(format!("0 {}\n", log.len()).as_bytes());
        buf.extend_from_slice(&log);

        let back = read_capture(&mut buf.as_slice()).unwrap();
        assert_eq!(back.html, "");
        assert_eq!(back.log, "legacy log");
        assert_eq!(back.coarse, "crawler failure");
        assert_eq!(back.elapsed, 1.5);
    }

    #[test]
    fn bad_magic_rejected() {
        let mut data: &[u8] = b"\x7Fcap 99\nrest";
        assert!(matches!(
            read_capture(&mut data),
            Err(CaptureFormatError::BadMagic)
        ));
    }

    #[test]
    fn truncated_header_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC_V01);
        buf.extend_from_slice(b"http://example.com/\n");
        assert!(read_capture(&mut buf.as_slice()).is_err());
    }

    #[test]
    fn urls_with_spaces_in_detail_survive() {
        let rec = CaptureRecord {
            detail: "503 Service Unavailable".to_string(),
            coarse: "service unavailable (503)".to_string(),
            ..record()
        };
        let mut buf = Vec::new();
        write_capture(&mut buf, &rec).unwrap();
        let back = read_capture(&mut buf.as_slice()).unwrap();
        assert_eq!(back.detail, "503 Service Unavailable");
        assert_eq!(back.coarse, "service unavailable (503)");
    }
}
