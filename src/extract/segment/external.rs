//! Long-running external segmenter processes.
//!
//! Statistical segmenters are expensive to start, so one child process per
//! language is kept alive across batches. The host writes presegmented items
//! on the child's stdin, one per line, and reads tokens back on stdout. A
//! sentinel marks the end of each batch: U+FDD0 is a permanent Unicode
//! noncharacter, passes through any real segmenter unmolested, and cannot
//! occur in the text itself. Every line written must fit in one pipe-atomic
//! write unit; longer items are pre-chunked.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use thiserror::Error;
use tracing::{debug, warn};

/// Batch delimiter; see module docs.
pub const SENTINEL: char = '\u{FDD0}';

/// Guaranteed-atomic pipe write size (POSIX minimum), minus the newline.
const PIPE_BUF: usize = 4096;

#[derive(Debug, Error)]
pub enum SegmenterProcessError {
    #[error("failed to spawn segmenter {argv:?}: {source}")]
    Spawn {
        argv: Vec<String>,
        source: std::io::Error,
    },
    #[error("segmenter pipe error: {0}")]
    Pipe(#[from] std::io::Error),
    #[error("segmenter process exited")]
    Exited,
}

struct Running {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// One external segmenter child, spawned on first use.
pub struct ExternalSegmenter {
    argv: Vec<String>,
    running: Option<Running>,
    /// Set after a fatal pipe error so we don't respawn a crashing command
    /// once per word.
    poisoned: bool,
}

impl ExternalSegmenter {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            running: None,
            poisoned: false,
        }
    }

    fn ensure_running(&mut self) -> Result<&mut Running, SegmenterProcessError> {
        if self.poisoned {
            return Err(SegmenterProcessError::Exited);
        }
        if self.running.is_none() {
            debug!(argv = ?self.argv, "spawning external segmenter");
            let mut child = Command::new(&self.argv[0])
                .args(&self.argv[1..])
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .spawn()
                .map_err(|source| SegmenterProcessError::Spawn {
                    argv: self.argv.clone(),
                    source,
                })?;
            let stdin = child.stdin.take().expect("piped stdin");
            let stdout = BufReader::new(child.stdout.take().expect("piped stdout"));
            self.running = Some(Running {
                child,
                stdin,
                stdout,
            });
        }
        Ok(self.running.as_mut().unwrap())
    }

    /// Segment one presegmented item; blocks until the sentinel comes back.
    pub fn segment(&mut self, item: &str) -> Result<Vec<String>, SegmenterProcessError> {
        let result = self.segment_inner(item);
        if result.is_err() {
            self.poison();
        }
        result
    }

    fn segment_inner(&mut self, item: &str) -> Result<Vec<String>, SegmenterProcessError> {
        let proc = self.ensure_running()?;

        for chunk in chunk_for_pipe(item) {
            proc.stdin.write_all(chunk.as_bytes())?;
            proc.stdin.write_all(b"\n")?;
        }
        let mut sentinel_line = [0u8; 4];
        proc.stdin
            .write_all(SENTINEL.encode_utf8(&mut sentinel_line).as_bytes())?;
        proc.stdin.write_all(b"\n")?;
        proc.stdin.flush()?;

        let mut tokens = Vec::new();
        let mut line = String::new();
        loop {
            line.clear();
            if proc.stdout.read_line(&mut line)? == 0 {
                return Err(SegmenterProcessError::Exited);
            }
            for token in line.split_whitespace() {
                if token.contains(SENTINEL) {
                    return Ok(tokens);
                }
                tokens.push(token.to_string());
            }
        }
    }

    fn poison(&mut self) {
        self.poisoned = true;
        if let Some(mut running) = self.running.take() {
            let _ = running.child.kill();
            let _ = running.child.wait();
            warn!(argv = ?self.argv, "external segmenter abandoned after error");
        }
    }
}

impl Drop for ExternalSegmenter {
    fn drop(&mut self) {
        if let Some(mut running) = self.running.take() {
            // Closing stdin lets well-behaved segmenters exit on their own.
            drop(running.stdin);
            let _ = running.child.kill();
            let _ = running.child.wait();
        }
    }
}

/// Split an item into pieces that each fit in a pipe-atomic write. Splits on
/// char boundaries; the presegmenter has already bounded pathological runs,
/// this is the backstop.
fn chunk_for_pipe(item: &str) -> Vec<&str> {
    if item.len() < PIPE_BUF {
        return vec![item];
    }
    let mut chunks = Vec::new();
    let mut rest = item;
    while rest.len() >= PIPE_BUF {
        let mut cut = PIPE_BUF - 4;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let (head, tail) = rest.split_at(cut);
        chunks.push(head);
        rest = tail;
    }
    if !rest.is_empty() {
        chunks.push(rest);
    }
    chunks
}
