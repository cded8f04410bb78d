// Per-session state shared by the command shells and the telemetry consumers:
// one render flag per telemetry stream and the sink rendered lines go to.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

const STREAM_COUNT: usize = 7;

/// Telemetry streams that can be switched on and off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Encoder,
    Imu,
    ImuRaw,
    Proximity,
    Gps,
    Servo,
    Text,
}

impl Stream {
    pub const ALL: [Stream; STREAM_COUNT] = [
        Stream::Encoder,
        Stream::Imu,
        Stream::ImuRaw,
        Stream::Proximity,
        Stream::Gps,
        Stream::Servo,
        Stream::Text,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// Streams rendered before anyone asks for them
    fn enabled_by_default(self) -> bool {
        matches!(self, Stream::Text)
    }

    pub fn name(self) -> &'static str {
        match self {
            Stream::Encoder => "encoder",
            Stream::Imu => "imu",
            Stream::ImuRaw => "imu_raw",
            Stream::Proximity => "proximity",
            Stream::Gps => "gps",
            Stream::Servo => "servo",
            Stream::Text => "text",
        }
    }
}

/// Destination for console lines
pub trait Sink: Send + Sync {
    fn write_line(&self, line: &str);
}

/// Writes to stdout
pub struct ConsoleSink;

impl Sink for ConsoleSink {
    fn write_line(&self, line: &str) {
        let mut out = std::io::stdout().lock();
        // Console output is best effort
        let _ = writeln!(out, "{}", line);
        let _ = out.flush();
    }
}

/// Collects lines in memory
#[derive(Default)]
pub struct BufferSink {
    lines: Mutex<Vec<String>>,
}

impl BufferSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Drain everything written so far
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.lines.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl Sink for BufferSink {
    fn write_line(&self, line: &str) {
        self.lines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(line.to_string());
    }
}

/// Render flags plus the active output sink
pub struct Session {
    toggles: [AtomicBool; STREAM_COUNT],
    sink: RwLock<Arc<dyn Sink>>,
}

impl Session {
    pub fn new(sink: Arc<dyn Sink>) -> Self {
        Self {
            toggles: Stream::ALL.map(|stream| AtomicBool::new(stream.enabled_by_default())),
            sink: RwLock::new(sink),
        }
    }

    pub fn is_enabled(&self, stream: Stream) -> bool {
        self.toggles[stream.index()].load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, stream: Stream, enabled: bool) {
        self.toggles[stream.index()].store(enabled, Ordering::Relaxed);
    }

    /// Flip a stream and return its new state
    pub fn toggle(&self, stream: Stream) -> bool {
        !self.toggles[stream.index()].fetch_xor(true, Ordering::Relaxed)
    }

    /// Route rendered telemetry to `sink` from now on
    pub fn set_sink(&self, sink: Arc<dyn Sink>) {
        *self.sink.write().unwrap_or_else(|e| e.into_inner()) = sink;
    }

    pub fn sink(&self) -> Arc<dyn Sink> {
        self.sink.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Write one line to the active sink
    pub fn emit(&self, line: &str) {
        self.sink().write_line(line);
    }
}
