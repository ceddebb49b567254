// Serial port discovery and non-blocking line I/O
//
// The link manager only talks to hardware through `SerialBackend`, so the state
// machine can be driven by an in-memory backend in tests.

use serialport::{SerialPort, SerialPortType};
use std::future::Future;
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use super::protocol::{is_ack, to_hex};

/// Read timeout; bounds how long the reader thread takes to notice a close
pub const READ_TIMEOUT_MS: u64 = 100;

/// Lines waiting for the writer thread; four ticks of two motors
pub const WRITE_QUEUE_LEN: usize = 8;

/// Error types for the serial link
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No serial device with id {vendor_id:04x}:{product_id:04x}")]
    DeviceNotFound { vendor_id: u16, product_id: u16 },

    #[error("Serial writer for {port} has stopped")]
    WriterGone { port: String },

    #[error("Serial writer for {port} is behind, line dropped")]
    WriteQueueFull { port: String },

    #[error("Blocking serial task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// One enumerated serial port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortCandidate {
    pub path: String,
    /// USB vendor/product ids, if the port is a USB device
    pub usb_id: Option<(u16, u16)>,
}

/// First port whose USB identity matches `vendor_id:product_id`
pub fn select_port(
    candidates: &[PortCandidate],
    vendor_id: u16,
    product_id: u16,
) -> Option<&PortCandidate> {
    candidates
        .iter()
        .find(|c| c.usb_id == Some((vendor_id, product_id)))
}

/// An open serial link accepting command lines
pub trait SerialDevice: Send + 'static {
    /// Queue a line for transmission without waiting for the device
    fn write_line(&mut self, line: &str) -> Result<(), LinkError>;

    /// Release the port
    fn close(self);
}

/// Source of serial ports: the OS in production, a script in tests
pub trait SerialBackend: Send + Sync + 'static {
    type Device: SerialDevice;

    fn available_ports(&self) -> impl Future<Output = Result<Vec<PortCandidate>, LinkError>> + Send;

    fn open(
        &self,
        path: &str,
        baud_rate: u32,
    ) -> impl Future<Output = Result<Self::Device, LinkError>> + Send;
}

/// Backend over the operating system's serial ports
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSerial;

impl SerialBackend for SystemSerial {
    type Device = ThreadedPort;

    async fn available_ports(&self) -> Result<Vec<PortCandidate>, LinkError> {
        let ports = tokio::task::spawn_blocking(serialport::available_ports).await??;

        Ok(ports
            .into_iter()
            .map(|p| {
                let usb_id = match p.port_type {
                    SerialPortType::UsbPort(usb) => Some((usb.vid, usb.pid)),
                    _ => None,
                };
                PortCandidate {
                    path: p.port_name,
                    usb_id,
                }
            })
            .collect())
    }

    async fn open(&self, path: &str, baud_rate: u32) -> Result<ThreadedPort, LinkError> {
        let path = path.to_string();
        tokio::task::spawn_blocking(move || ThreadedPort::open(&path, baud_rate)).await?
    }
}

/// Bounded line queue in front of the writer thread
///
/// A full queue drops the new line instead of blocking, so a stalled adapter
/// never builds up a backlog of stale velocity commands.
struct WriteQueue {
    path: String,
    tx: mpsc::SyncSender<String>,
    dropping: bool,
}

impl WriteQueue {
    fn new(path: &str, capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::sync_channel(capacity);
        let queue = Self {
            path: path.to_string(),
            tx,
            dropping: false,
        };
        (queue, rx)
    }

    fn push(&mut self, line: &str) -> Result<(), LinkError> {
        match self.tx.try_send(line.to_string()) {
            Ok(()) => {
                if self.dropping {
                    info!("Serial port {} writer caught up", self.path);
                    self.dropping = false;
                }
                Ok(())
            }
            Err(mpsc::TrySendError::Full(_)) => {
                if !self.dropping {
                    warn!("Serial port {} is not keeping up, dropping commands", self.path);
                    self.dropping = true;
                }
                Err(LinkError::WriteQueueFull {
                    port: self.path.clone(),
                })
            }
            Err(mpsc::TrySendError::Disconnected(_)) => Err(LinkError::WriterGone {
                port: self.path.clone(),
            }),
        }
    }
}

/// Serial port served by a writer thread and a reader thread
///
/// Writes are queued to the writer thread so a stalled device never blocks the caller.
pub struct ThreadedPort {
    queue: WriteQueue,
    closed: Arc<AtomicBool>,
}

impl ThreadedPort {
    fn open(path: &str, baud_rate: u32) -> Result<Self, LinkError> {
        let port = serialport::new(path, baud_rate)
            .timeout(Duration::from_millis(READ_TIMEOUT_MS))
            .open()?;
        let reader = port.try_clone()?;

        let (queue, rx) = WriteQueue::new(path, WRITE_QUEUE_LEN);
        let closed = Arc::new(AtomicBool::new(false));

        let writer_path = path.to_string();
        thread::Builder::new()
            .name("serial-writer".into())
            .spawn(move || write_loop(port, rx, &writer_path))?;

        let reader_path = path.to_string();
        let reader_closed = closed.clone();
        thread::Builder::new()
            .name("serial-reader".into())
            .spawn(move || read_loop(reader, reader_closed, &reader_path))?;

        Ok(Self { queue, closed })
    }
}

impl SerialDevice for ThreadedPort {
    fn write_line(&mut self, line: &str) -> Result<(), LinkError> {
        self.queue.push(line)
    }

    fn close(self) {
        // Writer drains its queue then drops the port when the sender goes away
        self.closed.store(true, Ordering::Release);
        let WriteQueue { path, tx, .. } = self.queue;
        drop(tx);
        info!("Serial port {} closed", path);
    }
}

fn write_loop(mut port: Box<dyn SerialPort>, rx: mpsc::Receiver<String>, path: &str) {
    while let Ok(line) = rx.recv() {
        if let Err(e) = port.write_all(line.as_bytes()) {
            warn!("Serial port {} write error: {}", path, e);
        }
    }
    debug!("Serial writer for {} stopped", path);
}

fn read_loop(mut port: Box<dyn SerialPort>, closed: Arc<AtomicBool>, path: &str) {
    let mut buf = [0u8; 256];

    while !closed.load(Ordering::Acquire) {
        match port.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => log_inbound(&buf[..n]),
            Err(e) if e.kind() == ErrorKind::TimedOut => {}
            Err(e) => {
                warn!("Serial port {} error: {}", path, e);
                break;
            }
        }
    }
    debug!("Serial reader for {} stopped", path);
}

fn log_inbound(data: &[u8]) {
    if is_ack(data) {
        trace!("Serial port ack");
    } else {
        info!(
            "Serial port data: {} {:?}",
            to_hex(data),
            String::from_utf8_lossy(data)
        );
    }
}
