use std::fmt;
use std::io::{self, Write};

/// The leveled logging sink used by the framework and its middlewares.
///
/// A [`Ship`](crate::Ship) without a logger drops its messages.
pub trait Logger: Send + Sync {
    fn debug(&self, args: fmt::Arguments<'_>);
    fn info(&self, args: fmt::Arguments<'_>);
    fn warn(&self, args: fmt::Arguments<'_>);
    fn error(&self, args: fmt::Arguments<'_>);

    /// Returns a writer for the error log of the underlying HTTP server.
    fn writer(&self) -> Box<dyn Write + Send> {
        Box::new(io::sink())
    }
}

/// A [`Logger`] forwarding to the `log` facade under the "ship" target.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogLogger;

impl Logger for LogLogger {
    fn debug(&self, args: fmt::Arguments<'_>) {
        log::debug!(target: "ship", "{}", args);
    }

    fn info(&self, args: fmt::Arguments<'_>) {
        log::info!(target: "ship", "{}", args);
    }

    fn warn(&self, args: fmt::Arguments<'_>) {
        log::warn!(target: "ship", "{}", args);
    }

    fn error(&self, args: fmt::Arguments<'_>) {
        log::error!(target: "ship", "{}", args);
    }

    fn writer(&self) -> Box<dyn Write + Send> {
        Box::new(LogWriter::default())
    }
}

/// Turns written lines into error records.
#[derive(Debug, Default)]
struct LogWriter {
    line: Vec<u8>,
}

impl LogWriter {
    fn emit(&mut self) {
        let line = String::from_utf8_lossy(&self.line);
        let line = line.trim_end();
        if !line.is_empty() {
            log::error!(target: "ship", "{}", line);
        }
        self.line.clear();
    }
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &byte in buf {
            if byte == b'\n' {
                self.emit();
            } else {
                self.line.push(byte);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.line.is_empty() {
            self.emit();
        }
        Ok(())
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}
