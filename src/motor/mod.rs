// Motor side of the bridge
//
// Provides:
// - CAN-over-serial command encoding
// - Serial port discovery and non-blocking I/O (real and simulated)
// - Serial link lifecycle with debounced close

pub mod link;
pub mod protocol;
pub mod serial;
pub mod sim;

pub use link::{LinkConfig, LinkHandle, LinkState};
pub use protocol::{encode_stop_command, encode_velocity_command};
pub use serial::{LinkError, SerialBackend, SerialDevice, SystemSerial};
pub use sim::SimulatedSerial;
