//! Console output captured in memory

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use plughost_runtime::Console;

use crate::fixture::wait_until;

/// Collects everything written to a [`Console`].
#[derive(Clone, Default)]
pub struct CapturedConsole {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl CapturedConsole {
    pub fn new() -> Self {
        Self::default()
    }

    /// A console writing into this capture.
    pub fn console(&self) -> Console {
        Console::new(self.clone())
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buf.lock()).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_string).collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.contents().contains(needle)
    }

    /// Lines containing `needle`.
    pub fn count(&self, needle: &str) -> usize {
        self.lines().iter().filter(|l| l.contains(needle)).count()
    }

    /// Wait until `needle` has been written `times` times.
    pub async fn wait_for_count(&self, needle: &str, times: usize, timeout: Duration) -> bool {
        wait_until(timeout, || self.count(needle) >= times).await
    }

    /// Wait until `needle` has been written.
    pub async fn wait_for(&self, needle: &str, timeout: Duration) -> bool {
        self.wait_for_count(needle, 1, timeout).await
    }
}

impl Write for CapturedConsole {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.lock().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_captures_lines() {
        let captured = CapturedConsole::new();
        let console = captured.console();
        console.line("one");
        console.print("two\nthree");

        assert_eq!(captured.lines(), vec!["one", "two", "three"]);
        assert!(captured.wait_for("three", Duration::from_millis(10)).await);
        assert!(!captured.wait_for("four", Duration::from_millis(10)).await);
    }
}
