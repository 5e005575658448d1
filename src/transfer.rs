//! Moving one file across one data channel.
//!
//! The sending side writes a single framed message whose header is the file
//! size, streaming the body from disk. The receiving side reads the header,
//! reserves a destination name, and writes chunks to disk as they arrive.
//! Neither side retries; whatever happened is summed up in a `Tally`.

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::framing::{read_header, write_header, write_payload};
use crate::fs_enum::base_name;

const CHUNK: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Sent,
    Received,
}

/// Raw result of one send or receive.
#[derive(Debug)]
pub struct Tally {
    pub transferred: u64,
    pub expected: u64,
    pub error: Option<Error>,
}

impl Tally {
    fn failed(expected: u64, error: Error) -> Self {
        Self {
            transferred: 0,
            expected,
            error: Some(error),
        }
    }
}

/// What a transfer worker reports when it finishes. Produced once, never retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferOutcome {
    pub id: Uuid,
    pub timestamp: String,
    pub direction: Direction,
    /// Name as requested on the control channel
    pub file: String,
    /// Where a received file was written (after collision renaming)
    pub saved_as: Option<PathBuf>,
    pub peer: Option<SocketAddr>,
    pub transferred: u64,
    pub expected: u64,
    pub error: Option<String>,
}

impl TransferOutcome {
    pub fn new(
        id: Uuid,
        direction: Direction,
        file: &str,
        peer: Option<SocketAddr>,
        tally: Tally,
        saved_as: Option<PathBuf>,
    ) -> Self {
        Self {
            id,
            timestamp: Utc::now().to_rfc3339(),
            direction,
            file: file.to_string(),
            saved_as,
            peer,
            transferred: tally.transferred,
            expected: tally.expected,
            error: tally.error.map(|e| e.to_string()),
        }
    }

    /// Outcome for a transfer that never got a data connection.
    pub fn aborted(id: Uuid, direction: Direction, file: &str, reason: impl Into<String>) -> Self {
        Self {
            id,
            timestamp: Utc::now().to_rfc3339(),
            direction,
            file: file.to_string(),
            saved_as: None,
            peer: None,
            transferred: 0,
            expected: 0,
            error: Some(reason.into()),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.error.is_none() && self.transferred == self.expected
    }

    /// Client-facing summary line.
    pub fn summary(&self) -> String {
        match (self.direction, &self.saved_as) {
            (Direction::Received, Some(saved)) => format!(
                "Retrieved {} of {} bytes for '{}' and saved as '{}'",
                self.transferred,
                self.expected,
                self.file,
                saved.file_name().unwrap_or(saved.as_os_str()).to_string_lossy()
            ),
            (Direction::Received, None) => format!(
                "Retrieved {} of {} bytes for '{}'",
                self.transferred, self.expected, self.file
            ),
            (Direction::Sent, _) => format!(
                "Sent {} of {} bytes for '{}'",
                self.transferred, self.expected, self.file
            ),
        }
    }
}

/// Open a file for sending, checking it is a readable regular file.
/// Returns the handle and its size.
pub fn open_source(path: &Path) -> Result<(File, u64)> {
    let not_found = || Error::FileNotFound(path.to_path_buf());
    let file = File::open(path).map_err(|_| not_found())?;
    let meta = file.metadata().map_err(|_| not_found())?;
    if !meta.is_file() {
        return Err(not_found());
    }
    Ok((file, meta.len()))
}

/// Send `len` bytes of `source` as one framed message.
pub fn send_file<W, R>(writer: &mut W, source: &mut R, len: u64) -> Tally
where
    W: Write + ?Sized,
    R: Read + ?Sized,
{
    if let Err(e) = write_header(writer, len) {
        return Tally::failed(len, e);
    }
    let mut sent = 0u64;
    let mut buf = vec![0u8; CHUNK.min(len.max(1) as usize)];
    while sent < len {
        let want = (len - sent).min(buf.len() as u64) as usize;
        let n = match source.read(&mut buf[..want]) {
            Ok(0) => {
                let e = io::Error::new(ErrorKind::UnexpectedEof, "file shrank while sending");
                return Tally {
                    transferred: sent,
                    expected: len,
                    error: Some(Error::Io(e)),
                };
            }
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                return Tally {
                    transferred: sent,
                    expected: len,
                    error: Some(Error::Io(e)),
                }
            }
        };
        if let Err(e) = write_payload(writer, &buf[..n], &mut sent) {
            return Tally {
                transferred: sent,
                expected: len,
                error: Some(e),
            };
        }
    }
    let error = writer.flush().err().map(|e| Error::Transport {
        transferred: sent,
        source: e,
    });
    Tally {
        transferred: sent,
        expected: len,
        error,
    }
}

/// Receive one framed file into `dir`, under a collision-free variant of
/// `requested`'s base name. Returns the tally and the path written, if any.
pub fn receive_file<R>(reader: &mut R, dir: &Path, requested: &str) -> (Tally, Option<PathBuf>)
where
    R: Read + ?Sized,
{
    let len = match read_header(reader) {
        Ok(len) => len,
        Err(e) => return (Tally::failed(0, e), None),
    };
    let (mut file, dest) = match create_unique(dir, requested) {
        Ok(x) => x,
        Err(e) => return (Tally::failed(len, e), None),
    };

    let mut received = 0u64;
    let mut buf = vec![0u8; CHUNK.min(len.max(1) as usize)];
    let mut error = None;
    while received < len {
        let want = (len - received).min(buf.len() as u64) as usize;
        match reader.read(&mut buf[..want]) {
            Ok(0) => {
                error = Some(Error::ConnectionBroken {
                    transferred: received,
                    partial: Vec::new(),
                });
                break;
            }
            Ok(n) => {
                if let Err(e) = file.write_all(&buf[..n]) {
                    error = Some(Error::FileUnwritable {
                        path: dest.clone(),
                        source: e,
                    });
                    break;
                }
                received += n as u64;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                error = Some(Error::Transport {
                    transferred: received,
                    source: e,
                });
                break;
            }
        }
    }
    if error.is_none() {
        if let Err(e) = file.flush() {
            error = Some(Error::FileUnwritable {
                path: dest.clone(),
                source: e,
            });
        }
    }
    (
        Tally {
            transferred: received,
            expected: len,
            error,
        },
        Some(dest),
    )
}

fn candidate(dir: &Path, stem: &str, ext: Option<&str>, n: u32) -> PathBuf {
    let name = match (n, ext) {
        (0, Some(ext)) => format!("{stem}.{ext}"),
        (0, None) => stem.to_string(),
        (n, Some(ext)) => format!("{stem}({n}).{ext}"),
        (n, None) => format!("{stem}({n})"),
    };
    dir.join(name)
}

fn split_name(name: &str) -> (String, Option<String>) {
    let p = Path::new(name);
    let stem = p
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let ext = p.extension().map(|e| e.to_string_lossy().into_owned());
    (stem, ext)
}

/// Create the first unused name for `requested` in `dir`: `name.ext`, then
/// `name(1).ext`, `name(2).ext`, ... Creation is atomic, so two concurrent
/// receivers can never pick the same name.
pub fn create_unique(dir: &Path, requested: &str) -> Result<(File, PathBuf)> {
    let name = base_name(requested).ok_or_else(|| Error::FileUnwritable {
        path: PathBuf::from(requested),
        source: io::Error::new(ErrorKind::InvalidInput, "no file name"),
    })?;
    let (stem, ext) = split_name(&name);
    let mut n = 0u32;
    loop {
        let path = candidate(dir, &stem, ext.as_deref(), n);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((file, path)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => n += 1,
            Err(e) => return Err(Error::FileUnwritable { path, source: e }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::send_message;
    use std::fs;
    use std::io::Cursor;
    use tempfile::TempDir;

    #[test]
    fn collision_suffix_goes_before_extension() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path();
        fs::write(dir.join("report.txt"), "original").unwrap();

        let (_, first) = create_unique(dir, "report.txt").unwrap();
        let (_, second) = create_unique(dir, "report.txt").unwrap();
        assert_eq!(first, dir.join("report(1).txt"));
        assert_eq!(second, dir.join("report(2).txt"));
        assert_eq!(fs::read_to_string(dir.join("report.txt")).unwrap(), "original");
    }

    #[test]
    fn collision_naming_edge_cases() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path();
        for name in ["Makefile", ".bashrc", "archive.tar.gz"] {
            fs::write(dir.join(name), "x").unwrap();
        }
        let created = |name: &str| create_unique(dir, name).map(|(_, path)| path);
        assert_eq!(created("Makefile").unwrap(), dir.join("Makefile(1)"));
        assert_eq!(created(".bashrc").unwrap(), dir.join(".bashrc(1)"));
        assert_eq!(created("archive.tar.gz").unwrap(), dir.join("archive.tar(1).gz"));
        assert_eq!(created("nested/dir/new.txt").unwrap(), dir.join("new.txt"));
        assert!(created("..").is_err());
    }

    #[test]
    fn send_then_receive_streams_file() {
        let tmp = TempDir::new().unwrap();
        let body: Vec<u8> = (0..700_000u32).map(|i| (i % 251) as u8).collect();

        let mut wire = Vec::new();
        let tally = send_file(&mut wire, &mut Cursor::new(&body), body.len() as u64);
        assert!(tally.error.is_none());
        assert_eq!(tally.transferred, body.len() as u64);

        let (tally, dest) = receive_file(&mut Cursor::new(wire), tmp.path(), "blob.bin");
        assert!(tally.error.is_none());
        assert_eq!(tally.expected, body.len() as u64);
        let dest = dest.unwrap();
        assert_eq!(dest, tmp.path().join("blob.bin"));
        assert_eq!(fs::read(dest).unwrap(), body);
    }

    #[test]
    fn receive_reports_short_transfer() {
        let tmp = TempDir::new().unwrap();
        let mut wire = b"0000000100".to_vec();
        wire.extend_from_slice(&[7u8; 40]);

        let (tally, dest) = receive_file(&mut Cursor::new(wire), tmp.path(), "cut.bin");
        assert_eq!(tally.transferred, 40);
        assert_eq!(tally.expected, 100);
        assert!(matches!(tally.error, Some(Error::ConnectionBroken { .. })));
        assert_eq!(fs::read(dest.unwrap()).unwrap().len(), 40);
    }

    #[test]
    fn receive_rejects_bad_header_without_creating_file() {
        let tmp = TempDir::new().unwrap();
        let (tally, dest) = receive_file(&mut Cursor::new(b"12345abcde".to_vec()), tmp.path(), "x");
        assert!(matches!(tally.error, Some(Error::ProtocolMismatch { .. })));
        assert!(dest.is_none());
        assert!(fs::read_dir(tmp.path()).unwrap().next().is_none());
    }

    #[test]
    fn send_reports_shrunk_source() {
        let mut wire = Vec::new();
        let tally = send_file(&mut wire, &mut Cursor::new(vec![1u8; 10]), 20);
        assert_eq!(tally.transferred, 10);
        assert_eq!(tally.expected, 20);
        assert!(tally.error.is_some());
    }

    #[test]
    fn empty_file_round_trips() {
        let tmp = TempDir::new().unwrap();
        let mut wire = Vec::new();
        send_message(&mut wire, b"").unwrap();
        let (tally, dest) = receive_file(&mut Cursor::new(wire), tmp.path(), "empty");
        assert!(tally.error.is_none());
        assert_eq!(fs::metadata(dest.unwrap()).unwrap().len(), 0);
    }

    #[test]
    fn open_source_requires_regular_file() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(open_source(tmp.path()), Err(Error::FileNotFound(_))));
        assert!(matches!(
            open_source(&tmp.path().join("nope")),
            Err(Error::FileNotFound(_))
        ));
        fs::write(tmp.path().join("f"), "abc").unwrap();
        assert_eq!(open_source(&tmp.path().join("f")).unwrap().1, 3);
    }

    #[test]
    fn outcome_summary_lines() {
        let id = Uuid::new_v4();
        let tally = Tally {
            transferred: 5,
            expected: 5,
            error: None,
        };
        let out = TransferOutcome::new(
            id,
            Direction::Received,
            "a.txt",
            None,
            tally,
            Some(PathBuf::from("/tmp/x/a(1).txt")),
        );
        assert!(out.is_complete());
        assert_eq!(out.summary(), "Retrieved 5 of 5 bytes for 'a.txt' and saved as 'a(1).txt'");

        let out = TransferOutcome::aborted(id, Direction::Sent, "b.txt", "cancelled");
        assert!(!out.is_complete());
        assert_eq!(out.summary(), "Sent 0 of 0 bytes for 'b.txt'");
    }
}
