// In-memory serial backend for running without hardware
//
// Presents one fake adapter with the expected USB identity and records every
// enumeration, open, written line and close.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use super::serial::{LinkError, PortCandidate, SerialBackend, SerialDevice};

/// Path reported for the fake adapter
pub const SIM_PORT: &str = "sim://can-adapter";

#[derive(Debug, Default)]
struct Record {
    enumerations: usize,
    opens: Vec<String>,
    lines: Vec<String>,
    closes: usize,
}

/// Simulated serial backend (cheap to clone, clones share the record)
#[derive(Debug, Clone)]
pub struct SimulatedSerial {
    ports: Vec<PortCandidate>,
    record: Arc<Mutex<Record>>,
}

impl SimulatedSerial {
    /// One adapter with the given USB identity
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self::with_ports(vec![PortCandidate {
            path: SIM_PORT.to_string(),
            usb_id: Some((vendor_id, product_id)),
        }])
    }

    /// No adapter plugged in
    pub fn without_device() -> Self {
        Self::with_ports(Vec::new())
    }

    pub fn with_ports(ports: Vec<PortCandidate>) -> Self {
        Self {
            ports,
            record: Arc::new(Mutex::new(Record::default())),
        }
    }

    fn record(&self) -> MutexGuard<'_, Record> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enumerations(&self) -> usize {
        self.record().enumerations
    }

    pub fn opens(&self) -> Vec<String> {
        self.record().opens.clone()
    }

    pub fn closes(&self) -> usize {
        self.record().closes
    }

    pub fn lines(&self) -> Vec<String> {
        self.record().lines.clone()
    }

    /// Drain recorded lines
    pub fn take_lines(&self) -> Vec<String> {
        std::mem::take(&mut self.record().lines)
    }
}

impl SerialBackend for SimulatedSerial {
    type Device = SimulatedPort;

    async fn available_ports(&self) -> Result<Vec<PortCandidate>, LinkError> {
        self.record().enumerations += 1;
        Ok(self.ports.clone())
    }

    async fn open(&self, path: &str, baud_rate: u32) -> Result<SimulatedPort, LinkError> {
        debug!("Simulated open of {} at {} baud", path, baud_rate);
        self.record().opens.push(path.to_string());
        Ok(SimulatedPort {
            record: self.record.clone(),
        })
    }
}

/// Open handle on the simulated adapter
#[derive(Debug)]
pub struct SimulatedPort {
    record: Arc<Mutex<Record>>,
}

impl SerialDevice for SimulatedPort {
    fn write_line(&mut self, line: &str) -> Result<(), LinkError> {
        debug!("sim <- {}", line.trim_end());
        self.record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .lines
            .push(line.to_string());
        Ok(())
    }

    fn close(self) {
        self.record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closes += 1;
    }
}
