// Serial link lifecycle for the wheel motors
//
// A single task owns the device and runs the state machine
//   Disconnected -> Connecting -> Open -> Closing -> Disconnected
// Session presence arrives as requests, wheel frames arrive through a watch
// slot (latest wins), and the debounced close is a deadline inside the same
// select loop, so a reconnect and the close timer can never both act.

use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, error, info, warn};

use super::protocol::{encode_slot, encode_stop_command};
use super::serial::{LinkError, SerialBackend, SerialDevice, select_port};
use crate::config::{
    DISCONNECT_DELAY, MOTOR_IDS, PRODUCT_ID, SERIAL_BAUDRATE, SETTLE_DELAY, VENDOR_ID,
};
use crate::messages::WheelVelocities;

/// Link lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

/// Serial link settings
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    pub baud_rate: u32,
    /// Bus ids for wheel slot 0 and slot 1
    pub motor_ids: [u16; 2],
    /// Grace period after the last session leaves
    pub disconnect_delay: Duration,
    /// Pause between the stop commands and closing the port
    pub settle_delay: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            vendor_id: VENDOR_ID,
            product_id: PRODUCT_ID,
            baud_rate: SERIAL_BAUDRATE,
            motor_ids: MOTOR_IDS,
            disconnect_delay: DISCONNECT_DELAY,
            settle_delay: SETTLE_DELAY,
        }
    }
}

#[derive(Debug)]
enum LinkRequest {
    Connect,
    Disconnect,
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle to the link task; the only way to reach the device
#[derive(Debug, Clone)]
pub struct LinkHandle {
    requests: mpsc::UnboundedSender<LinkRequest>,
    frames: std::sync::Arc<watch::Sender<WheelVelocities>>,
    state: watch::Receiver<LinkState>,
}

impl LinkHandle {
    /// A session became active: cancel a pending close and open if needed
    pub fn connect(&self) {
        self.request(LinkRequest::Connect);
    }

    /// No session left: close after the debounce delay
    pub fn disconnect(&self) {
        self.request(LinkRequest::Disconnect);
    }

    /// Hand the latest wheel frame to the link; never waits on the device
    pub fn send_velocities(&self, velocities: WheelVelocities) {
        self.frames.send_replace(velocities);
    }

    /// Stop the motors, wait for them to settle, close, and end the task
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.requests.send(LinkRequest::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Receiver for observing state transitions
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    fn request(&self, request: LinkRequest) {
        if self.requests.send(request).is_err() {
            warn!("Serial link task is not running");
        }
    }
}

/// Start the link task
pub fn spawn<B: SerialBackend>(backend: B, config: LinkConfig) -> (LinkHandle, JoinHandle<()>) {
    let (req_tx, req_rx) = mpsc::unbounded_channel();
    let (frame_tx, frame_rx) = watch::channel([None, None]);
    let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);

    let manager = LinkManager {
        backend,
        config,
        device: None,
        state: state_tx,
        close_at: None,
    };
    let task = tokio::spawn(manager.run(req_rx, frame_rx));

    let handle = LinkHandle {
        requests: req_tx,
        frames: std::sync::Arc::new(frame_tx),
        state: state_rx,
    };
    (handle, task)
}

struct LinkManager<B: SerialBackend> {
    backend: B,
    config: LinkConfig,
    device: Option<B::Device>,
    state: watch::Sender<LinkState>,
    /// Pending debounced close
    close_at: Option<Instant>,
}

impl<B: SerialBackend> LinkManager<B> {
    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<LinkRequest>,
        mut frames: watch::Receiver<WheelVelocities>,
    ) {
        let mut frames_open = true;

        loop {
            let close_at = self.close_at.unwrap_or_else(Instant::now);

            tokio::select! {
                // Requests first: a session that already arrived beats an expired timer
                biased;

                request = requests.recv() => match request {
                    Some(LinkRequest::Connect) => self.connect().await,
                    Some(LinkRequest::Disconnect) => self.schedule_close(),
                    Some(LinkRequest::Shutdown(reply)) => {
                        self.close().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.close().await;
                        break;
                    }
                },

                _ = sleep_until(close_at), if self.close_at.is_some() => {
                    self.close().await;
                }

                changed = frames.changed(), if frames_open => match changed {
                    Ok(()) => {
                        let velocities = *frames.borrow_and_update();
                        self.write_frame(velocities);
                    }
                    Err(_) => frames_open = false,
                },
            }
        }
        debug!("Serial link task stopped");
    }

    fn set_state(&self, state: LinkState) {
        self.state.send_replace(state);
    }

    async fn connect(&mut self) {
        if self.close_at.take().is_some() {
            info!("Session returned, keeping serial port open");
        }

        if self.device.is_some() {
            debug!("Serial port already open");
            return;
        }

        self.set_state(LinkState::Connecting);
        match open_device(&self.backend, &self.config).await {
            Ok(device) => {
                self.device = Some(device);
                self.set_state(LinkState::Open);
            }
            Err(e @ LinkError::DeviceNotFound { .. }) => {
                error!("Serial port not found: {}", e);
                self.set_state(LinkState::Disconnected);
            }
            Err(e) => {
                error!("Failed to open serial port: {}", e);
                self.set_state(LinkState::Disconnected);
            }
        }
    }

    fn schedule_close(&mut self) {
        if self.device.is_none() {
            debug!("No serial port to close");
            return;
        }
        info!(
            "Closing serial port in {}ms unless a session returns",
            self.config.disconnect_delay.as_millis()
        );
        self.close_at = Some(Instant::now() + self.config.disconnect_delay);
    }

    /// Stop every motor, let them settle, then release the port
    async fn close(&mut self) {
        self.close_at = None;
        let Some(mut device) = self.device.take() else {
            return;
        };

        self.set_state(LinkState::Closing);
        for &id in &self.config.motor_ids {
            if let Err(e) = device.write_line(&encode_stop_command(id)) {
                warn!("Failed to stop motor {}: {}", id, e);
            }
        }
        sleep(self.config.settle_delay).await;

        device.close();
        self.set_state(LinkState::Disconnected);
    }

    fn write_frame(&mut self, velocities: WheelVelocities) {
        let Some(device) = self.device.as_mut() else {
            return;
        };

        for (&id, velocity) in self.config.motor_ids.iter().zip(velocities) {
            match device.write_line(&encode_slot(id, velocity)) {
                Ok(()) => {}
                // Already reported once by the port while it is behind
                Err(e @ LinkError::WriteQueueFull { .. }) => {
                    debug!("Serial write to motor {} skipped: {}", id, e)
                }
                Err(e) => warn!("Serial write to motor {} failed: {}", id, e),
            }
        }
    }
}

/// Find the adapter by USB identity and open it
///
/// Borrows only the backend and settings, so the manager itself is never
/// held across the awaits.
async fn open_device<B: SerialBackend>(
    backend: &B,
    config: &LinkConfig,
) -> Result<B::Device, LinkError> {
    let LinkConfig {
        vendor_id,
        product_id,
        baud_rate,
        ..
    } = *config;

    let ports = backend.available_ports().await?;
    let port = select_port(&ports, vendor_id, product_id).ok_or(LinkError::DeviceNotFound {
        vendor_id,
        product_id,
    })?;
    info!("Found serial port {}", port.path);

    let device = backend.open(&port.path, baud_rate).await?;
    info!("Opened serial port {} at {} baud", port.path, baud_rate);
    Ok(device)
}
