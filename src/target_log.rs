use bytes::{Buf, BytesMut};
use std::io::{self, Write};

#[macro_export]
macro_rules! target_debug {
    ($id: expr, $($arg:tt)*) => (
        log::debug!("[target:{}] {}", $id, std::format_args!($($arg)*))
    )
}

#[macro_export]
macro_rules! target_info {
    ($id: expr, $($arg:tt)*) => (
        log::info!("[target:{}] {}", $id, std::format_args!($($arg)*))
    )
}

#[macro_export]
macro_rules! target_warn {
    ($id: expr, $($arg:tt)*) => (
        log::warn!("[target:{}] {}", $id, std::format_args!($($arg)*))
    )
}

#[macro_export]
macro_rules! target_error {
    ($id: expr, $($arg:tt)*) => (
        log::error!("[target:{}] {}", $id, std::format_args!($($arg)*))
    )
}

/// Line-buffered writer that forwards a unit's output to the logger.
pub struct OutputSink {
    tag: String,
    suppress: bool,
    buf: BytesMut,
}

impl OutputSink {
    pub fn new(target: &str, stream: &str, suppress: bool) -> Self {
        Self {
            tag: format!("{}:{}", target, stream),
            suppress,
            buf: BytesMut::with_capacity(1024),
        }
    }

    /// Bytes still waiting for a line terminator.
    pub fn pending(&self) -> usize {
        self.buf.remaining()
    }

    fn emit(&self, line: &[u8]) {
        if self.suppress {
            return;
        }
        let line = String::from_utf8_lossy(line);
        let line = line.trim_end();
        if !line.is_empty() {
            log::info!("[{}] {}", self.tag, line);
        }
    }

    fn drain_lines(&mut self) {
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line = self.buf.split_to(pos + 1);
            self.emit(&line);
        }
    }
}

impl Write for OutputSink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        self.drain_lines();
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            let rest = self.buf.split();
            self.emit(&rest);
        }
        Ok(())
    }
}

impl Drop for OutputSink {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_splits_lines() {
        let mut sink = OutputSink::new("png", "stdout", true);
        sink.write_all(b"first line\nsecond").unwrap();
        assert_eq!(sink.pending(), "second".len());
        sink.write_all(b" half\nthird\n").unwrap();
        assert_eq!(sink.pending(), 0);
        sink.write_all(b"tail").unwrap();
        sink.flush().unwrap();
        assert_eq!(sink.pending(), 0);
    }
}
