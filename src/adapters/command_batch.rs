//! A batch of wire lines written to one transport in a single write.

use super::Transport;
use crate::error::AppResult;

/// Lines queued for one port.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CommandBatch {
    port: String,
    lines: Vec<String>,
}

impl CommandBatch {
    /// Creates an empty batch for `port`.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            lines: Vec::new(),
        }
    }

    /// Adds a line to the batch.
    pub fn queue(&mut self, line: String) {
        self.lines.push(line);
    }

    /// Port the batch is written to.
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Returns the lines in the batch.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// True when no line is queued.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Writes every queued line as one write and empties the batch.
    ///
    /// On failure the batch is dropped, not kept for a retry.
    pub fn flush(&mut self, transport: &dyn Transport) -> AppResult<()> {
        if self.lines.is_empty() {
            return Ok(());
        }
        let lines = std::mem::take(&mut self.lines);
        transport.write_lines(&lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockTransport;

    #[test]
    fn test_batch_queue_and_flush() {
        let transport = MockTransport::new("COM1");
        let mut batch = CommandBatch::new("COM1");

        batch.queue("G90".to_string());
        batch.queue(">1G1X1.000Y0.000Z0.000P0.000T0.000".to_string());
        assert_eq!(batch.lines().len(), 2);

        batch.flush(&transport).unwrap();

        assert!(batch.is_empty());
        assert_eq!(transport.written(), vec!["G90", ">1G1X1.000Y0.000Z0.000P0.000T0.000"]);
        assert_eq!(transport.write_count(), 1);
    }

    #[test]
    fn test_failed_flush_drops_batch() {
        let transport = MockTransport::new("COM1");
        transport.trigger_failure();

        let mut batch = CommandBatch::new("COM1");
        batch.queue("?".to_string());
        assert!(batch.flush(&transport).is_err());
        assert!(batch.is_empty());
        assert!(transport.written().is_empty());
    }
}
