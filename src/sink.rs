//! Presentation side: where drained data units go.
//!
//! Sinks run inside [`RunController::poll`](crate::engine::RunController::poll)
//! and must not block.

use crate::engine::RunState;
use chrono::Utc;
use serde::Serialize;
use std::io::{self, BufWriter, Write};
use tracing::{info, warn};

/// One unit of measurement data, borrowed from the shared block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataUnit<'a> {
    /// Sequence number of the `DataReady` notification.
    pub sequence: u64,
    /// Token index that produced the data.
    pub origin: usize,
    /// Payload bytes.
    pub payload: &'a [u8],
}

impl DataUnit<'_> {
    /// Payload as text, with invalid UTF-8 replaced.
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(self.payload)
    }
}

/// Receives data units and state changes from the controller.
pub trait DataSink {
    /// Called once per data unit, in notification order.
    fn on_data(&mut self, unit: &DataUnit<'_>);

    /// Called whenever the run state changes.
    fn on_state(&mut self, _state: &RunState) {}
}

impl<S: DataSink + ?Sized> DataSink for Box<S> {
    fn on_data(&mut self, unit: &DataUnit<'_>) {
        (**self).on_data(unit);
    }

    fn on_state(&mut self, state: &RunState) {
        (**self).on_state(state);
    }
}

impl DataSink for Vec<Box<dyn DataSink + Send>> {
    fn on_data(&mut self, unit: &DataUnit<'_>) {
        for sink in self.iter_mut() {
            sink.on_data(unit);
        }
    }

    fn on_state(&mut self, state: &RunState) {
        for sink in self.iter_mut() {
            sink.on_state(state);
        }
    }
}

/// Logs every unit as a structured `tracing` event.
#[derive(Debug, Default)]
pub struct TracingSink;

impl DataSink for TracingSink {
    fn on_data(&mut self, unit: &DataUnit<'_>) {
        info!(
            sequence = unit.sequence,
            origin = unit.origin,
            bytes = unit.payload.len(),
            value = %unit.text().trim_end(),
            "Data"
        );
    }

    fn on_state(&mut self, state: &RunState) {
        info!(state = %state, "Run state changed");
    }
}

/// An owned copy of a data unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Sequence number of the `DataReady` notification.
    pub sequence: u64,
    /// Token index that produced the data.
    pub origin: usize,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

/// Keeps every unit and state in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    /// Units in arrival order.
    pub records: Vec<Record>,
    /// States in arrival order.
    pub states: Vec<RunState>,
}

impl CollectingSink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Payloads as lossy UTF-8 strings.
    pub fn texts(&self) -> Vec<String> {
        self.records
            .iter()
            .map(|r| String::from_utf8_lossy(&r.payload).into_owned())
            .collect()
    }
}

impl DataSink for CollectingSink {
    fn on_data(&mut self, unit: &DataUnit<'_>) {
        self.records.push(Record {
            sequence: unit.sequence,
            origin: unit.origin,
            payload: unit.payload.to_vec(),
        });
    }

    fn on_state(&mut self, state: &RunState) {
        self.states.push(state.clone());
    }
}

#[derive(Serialize)]
struct JsonLine<'a> {
    timestamp: String,
    sequence: u64,
    origin: usize,
    value: &'a str,
}

/// Writes one JSON object per unit.
pub struct JsonLinesSink {
    out: BufWriter<Box<dyn Write + Send>>,
    write_errors: u64,
}

impl JsonLinesSink {
    /// Wrap a writer.
    pub fn new(out: impl Write + Send + 'static) -> Self {
        Self {
            out: BufWriter::new(Box::new(out)),
            write_errors: 0,
        }
    }

    /// Create or truncate a file.
    pub fn create(path: &std::path::Path) -> io::Result<Self> {
        Ok(Self::new(std::fs::File::create(path)?))
    }

    /// Failed writes so far.
    pub fn write_errors(&self) -> u64 {
        self.write_errors
    }

    fn write_line(&mut self, unit: &DataUnit<'_>) -> io::Result<()> {
        let text = unit.text();
        let line = JsonLine {
            timestamp: Utc::now().to_rfc3339(),
            sequence: unit.sequence,
            origin: unit.origin,
            value: text.trim_end(),
        };
        serde_json::to_writer(&mut self.out, &line)?;
        self.out.write_all(b"\n")
    }
}

impl DataSink for JsonLinesSink {
    fn on_data(&mut self, unit: &DataUnit<'_>) {
        if let Err(e) = self.write_line(unit) {
            self.write_errors += 1;
            warn!(error = %e, sequence = unit.sequence, "Failed to write data line");
        }
    }

    fn on_state(&mut self, state: &RunState) {
        if state.is_done() {
            if let Err(e) = self.out.flush() {
                self.write_errors += 1;
                warn!(error = %e, "Failed to flush data output");
            }
        }
    }
}

impl Drop for JsonLinesSink {
    fn drop(&mut self) {
        let _ = self.out.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ExitStatus, Termination};
    use std::sync::{Arc, Mutex};
    use tracing_test::traced_test;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn unit(sequence: u64, payload: &[u8]) -> DataUnit<'_> {
        DataUnit {
            sequence,
            origin: 3,
            payload,
        }
    }

    #[test]
    fn test_collecting_sink() {
        let mut sink = CollectingSink::new();
        sink.on_data(&unit(2, b"0.51\r\n"));
        sink.on_state(&RunState::Running);
        assert_eq!(sink.records[0].sequence, 2);
        assert_eq!(sink.texts(), vec!["0.51\r\n"]);
        assert_eq!(sink.states, vec![RunState::Running]);
    }

    #[test]
    fn test_json_lines_sink() {
        let buf = SharedBuf::default();
        let mut sink = JsonLinesSink::new(buf.clone());
        sink.on_data(&unit(1, b"1.5e-3\n"));
        sink.on_data(&unit(2, b"1.6e-3\n"));
        sink.on_state(&RunState::Done(Termination::Graceful(ExitStatus::Completed)));

        let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["sequence"], 1);
        assert_eq!(lines[1]["value"], "1.6e-3");
        assert_eq!(lines[1]["origin"], 3);
        assert!(lines[0]["timestamp"].is_string());
        assert_eq!(sink.write_errors(), 0);
    }

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<CollectingSink>>);

    impl DataSink for SharedSink {
        fn on_data(&mut self, unit: &DataUnit<'_>) {
            self.0.lock().unwrap().on_data(unit);
        }

        fn on_state(&mut self, state: &RunState) {
            self.0.lock().unwrap().on_state(state);
        }
    }

    #[test]
    #[traced_test]
    fn test_fan_out() {
        let first = SharedSink::default();
        let second = SharedSink::default();
        let mut sinks: Vec<Box<dyn DataSink + Send>> = vec![
            Box::new(first.clone()),
            Box::new(TracingSink),
            Box::new(second.clone()),
        ];
        sinks.on_data(&unit(1, b"x"));
        sinks.on_data(&unit(2, b"y"));
        sinks.on_state(&RunState::Starting);

        for shared in [&first, &second] {
            let seen = shared.0.lock().unwrap();
            assert_eq!(seen.texts(), vec!["x", "y"]);
            assert_eq!(seen.records[1].sequence, 2);
            assert_eq!(seen.states, vec![RunState::Starting]);
        }
        assert!(logs_contain("value=y"));
    }
}
