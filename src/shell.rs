// Command shells: stdin (async) and an optional serial port (blocking thread).
// Both feed the same dispatcher and answer on their own sink.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::thread;

use serialport::SerialPort;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::{SERIAL_READ_TIMEOUT, SHELL_MAX_LINE};
use crate::dispatcher::{CommandOutcome, Dispatcher};
use crate::session::{ConsoleSink, Sink};

/// Dispatcher shared by every command source; the lock serializes commands
pub type SharedDispatcher = Arc<Mutex<Dispatcher>>;

/// Error types for the serial shell
#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run one command line against the shared dispatcher
pub fn execute(dispatcher: &SharedDispatcher, line: &str, out: &Arc<dyn Sink>) -> Option<CommandOutcome> {
    dispatcher
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .dispatch_line(line, out)
}

/// Dispatch every line received until all senders are gone
pub async fn serve_lines(
    mut lines: mpsc::UnboundedReceiver<String>,
    dispatcher: SharedDispatcher,
    out: Arc<dyn Sink>,
) {
    while let Some(line) = lines.recv().await {
        execute(&dispatcher, &line, &out);
    }
}

/// Interactive shell on the process's stdin/stdout
///
/// Stdin is read on its own thread so a pending read never holds up shutdown.
pub async fn run_stdin(dispatcher: SharedDispatcher) -> Result<(), ShellError> {
    let (tx, rx) = mpsc::unbounded_channel();
    thread::Builder::new().name("stdin-shell".into()).spawn(move || {
        for line in std::io::stdin().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("stdin read failed: {}", e);
                    break;
                }
            }
        }
    })?;

    info!("Shell ready on stdin (type 'help')");
    serve_lines(rx, dispatcher, Arc::new(ConsoleSink)).await;
    info!("stdin closed");
    Ok(())
}

/// Splits a raw byte stream into command lines
///
/// Lines end at CR or LF, empty lines are dropped, backspace/DEL erase the
/// previous byte and input past the line limit is discarded.
#[derive(Debug, Default)]
pub struct LineAssembler {
    buf: Vec<u8>,
}

impl LineAssembler {
    pub fn push(&mut self, byte: u8) -> Option<String> {
        match byte {
            b'\r' | b'\n' => {
                if self.buf.is_empty() {
                    return None;
                }
                let line = String::from_utf8_lossy(&self.buf).into_owned();
                self.buf.clear();
                Some(line)
            }
            0x08 | 0x7f => {
                self.buf.pop();
                None
            }
            _ => {
                if self.buf.len() < SHELL_MAX_LINE {
                    self.buf.push(byte);
                }
                None
            }
        }
    }
}

/// Writes CRLF-terminated lines to a serial port
pub struct SerialSink {
    port: Mutex<Box<dyn SerialPort>>,
}

impl SerialSink {
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self {
            port: Mutex::new(port),
        }
    }
}

impl Sink for SerialSink {
    fn write_line(&self, line: &str) {
        let mut port = self.port.lock().unwrap_or_else(|e| e.into_inner());
        let result = port
            .write_all(line.as_bytes())
            .and_then(|_| port.write_all(b"\r\n"))
            .and_then(|_| port.flush());
        if let Err(e) = result {
            warn!("Serial write failed: {}", e);
        }
    }
}

/// Open `path` and serve the shell on it from a dedicated thread
pub fn spawn_serial(
    path: &str,
    baudrate: u32,
    dispatcher: SharedDispatcher,
) -> Result<thread::JoinHandle<()>, ShellError> {
    let port = serialport::new(path, baudrate)
        .timeout(SERIAL_READ_TIMEOUT)
        .open()?;
    let out: Arc<dyn Sink> = Arc::new(SerialSink::new(port.try_clone()?));

    info!("Shell ready on {} at {} baud", path, baudrate);
    let handle = thread::Builder::new()
        .name("serial-shell".into())
        .spawn(move || serve_serial(port, dispatcher, out))?;
    Ok(handle)
}

fn serve_serial(mut port: Box<dyn SerialPort>, dispatcher: SharedDispatcher, out: Arc<dyn Sink>) {
    let mut assembler = LineAssembler::default();
    let mut buf = [0u8; 64];

    loop {
        match port.read(&mut buf) {
            Ok(n) => {
                for &byte in &buf[..n] {
                    if let Some(line) = assembler.push(byte) {
                        execute(&dispatcher, &line, &out);
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => {
                warn!("Serial shell stopped: {}", e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Middleware;
    use crate::dispatcher::DispatcherConfig;
    use crate::kinematics::{DriveParams, Topology};
    use crate::session::{BufferSink, Session, Stream};

    fn shared(console: Arc<BufferSink>) -> SharedDispatcher {
        let session = Arc::new(Session::new(console));
        let config = DispatcherConfig {
            differential: DriveParams::new(0.4, 0.05),
            omni: DriveParams::new(0.16, 0.035).with_max_wheel_speed(52.0),
            topology: Topology::Differential,
        };
        Arc::new(Mutex::new(Dispatcher::new(Middleware::new("test", 4), session, config)))
    }

    fn assemble(input: &[u8]) -> Vec<String> {
        let mut assembler = LineAssembler::default();
        input.iter().filter_map(|&b| assembler.push(b)).collect()
    }

    #[test]
    fn test_line_assembler_terminators() {
        assert_eq!(assemble(b"r 1 0\r\ns\n\n\rmem\r"), vec!["r 1 0", "s", "mem"]);
        assert!(assemble(b"partial").is_empty());
    }

    #[test]
    fn test_line_assembler_backspace_and_limit() {
        assert_eq!(assemble(b"ex\x08\r"), vec!["e"]);
        assert_eq!(assemble(b"\x7f\x7fi\n"), vec!["i"]);

        let mut long = vec![b'a'; SHELL_MAX_LINE + 20];
        long.push(b'\n');
        assert_eq!(assemble(&long)[0].len(), SHELL_MAX_LINE);
    }

    #[tokio::test]
    async fn test_serve_lines_dispatches_each_line() {
        let console = BufferSink::new();
        let dispatcher = shared(console.clone());
        let out: Arc<dyn Sink> = console.clone();

        let (tx, rx) = mpsc::unbounded_channel();
        for line in ["run 0 0 0", "", "bogus", "e"] {
            tx.send(line.to_string()).unwrap();
        }
        drop(tx);
        serve_lines(rx, dispatcher.clone(), out).await;

        assert_eq!(
            console.take(),
            vec!["SETPOINT: 0.000000 0.000000 0.000000", "bogus ?"]
        );
        let dispatcher = dispatcher.lock().unwrap();
        assert!(dispatcher.session().is_enabled(Stream::Encoder));
    }
}
