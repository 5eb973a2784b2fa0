//! Single-line progress display.
//!
//! On a terminal the line is rewritten in place with ANSI controls; when
//! stderr is redirected each update becomes a plain line, so batch logs stay
//! greppable. Every message is prefixed with elapsed time as
//! `d:hh:mm:ss.mmm`.

use std::sync::Mutex;
use std::time::Instant;

use console::Term;

pub struct StatusLine {
    term: Term,
    is_tty: bool,
    started: Instant,
    // Serializes writers so concurrent document tasks cannot interleave
    // partial lines.
    write_lock: Mutex<()>,
}

impl StatusLine {
    pub fn new() -> Self {
        let term = Term::stderr();
        let is_tty = term.features().is_attended();
        Self {
            term,
            is_tty,
            started: Instant::now(),
            write_lock: Mutex::new(()),
        }
    }

    fn elapsed(&self) -> String {
        let e = self.started.elapsed();
        let total = e.as_secs();
        let (d, rest) = (total / 86400, total % 86400);
        let (h, rest) = (rest / 3600, rest % 3600);
        let (m, s) = (rest / 60, rest % 60);
        format!("{}:{:02}:{:02}:{:02}.{:03}: ", d, h, m, s, e.subsec_millis())
    }

    /// Update the status line in place (TTY) or emit a line (non-TTY).
    pub fn update(&self, message: &str) {
        self.show(message, false);
    }

    /// Emit a message and advance to a fresh line.
    pub fn finish(&self, message: &str) {
        self.show(message, true);
    }

    fn show(&self, message: &str, done: bool) {
        let line = format!("{}{}", self.elapsed(), message);
        let _guard = self.write_lock.lock().unwrap();
        if self.is_tty {
            let _ = self.term.clear_line();
            let _ = self.term.write_str(&line);
            if done {
                let _ = self.term.write_line("");
            }
        } else {
            let _ = self.term.write_line(&line);
        }
    }
}

impl Default for StatusLine {
    fn default() -> Self {
        Self::new()
    }
}
