// Fixed-rate control loop and process wiring
//
// Every tick the loop takes one snapshot of the operator target, advances the
// smoother, and hands the result to the serial link. The link writes through
// its own task, so a slow adapter never delays the next tick.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{info, trace, warn};

use crate::config::{BridgeConfig, SHUTDOWN_TIMEOUT};
use crate::messages::{ControlTarget, WheelVelocities};
use crate::motor::{LinkHandle, SerialBackend, SimulatedSerial, SystemSerial};
use crate::session::{self, SessionController};
use crate::smoother::VelocitySmoother;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub struct ControlLoop {
    smoother: VelocitySmoother,
    targets: watch::Receiver<ControlTarget>,
    link: LinkHandle,
}

impl ControlLoop {
    pub fn new(targets: watch::Receiver<ControlTarget>, link: LinkHandle) -> Self {
        Self {
            smoother: VelocitySmoother::new(),
            targets,
            link,
        }
    }

    /// One control step: smooth toward the latest target and send it
    pub fn tick(&mut self) -> WheelVelocities {
        let target = *self.targets.borrow_and_update();
        let output = self.smoother.step(&target.velocities, target.smoothing);
        trace!("Wheel output {:?}", output);
        self.link.send_velocities(output);
        output
    }

    pub async fn run(mut self, period: Duration) {
        let mut tick = interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tick.tick().await;
            self.tick();
        }
    }
}

/// Running bridge: control loop, operator server and serial link
pub struct Bridge {
    local_addr: SocketAddr,
    sessions: Arc<SessionController>,
    link: LinkHandle,
    control_task: JoinHandle<()>,
    server_task: JoinHandle<()>,
    link_task: JoinHandle<()>,
}

impl Bridge {
    /// Start all tasks on an already bound listener
    pub fn start<B: SerialBackend>(
        backend: B,
        listener: TcpListener,
        config: &BridgeConfig,
    ) -> std::io::Result<Self> {
        let local_addr = listener.local_addr()?;

        let (link, link_task) = crate::motor::link::spawn(backend, config.link.clone());
        let sessions = Arc::new(SessionController::new(link.clone()));

        let control = ControlLoop::new(sessions.targets(), link.clone());
        let control_task = tokio::spawn(control.run(config.tick_period));
        let server_task = tokio::spawn(session::serve(listener, sessions.clone()));

        info!(
            "Bridge started: {}ms tick, motors {:?}, listening on {}",
            config.tick_period.as_millis(),
            config.link.motor_ids,
            local_addr
        );

        Ok(Self {
            local_addr,
            sessions,
            link,
            control_task,
            server_task,
            link_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn sessions(&self) -> &Arc<SessionController> {
        &self.sessions
    }

    pub fn link(&self) -> &LinkHandle {
        &self.link
    }

    /// Stop accepting operators and ticking, then stop the motors and close the port
    pub async fn shutdown(self) {
        self.server_task.abort();
        self.control_task.abort();

        if timeout(SHUTDOWN_TIMEOUT, self.link.shutdown()).await.is_err() {
            warn!("Serial link did not shut down within {:?}", SHUTDOWN_TIMEOUT);
            self.link_task.abort();
        }
        info!("Bridge stopped");
    }
}

pub async fn run(config: BridgeConfig) -> Result<(), BoxError> {
    if config.simulate {
        info!("Simulating the serial adapter");
        let backend = SimulatedSerial::new(config.link.vendor_id, config.link.product_id);
        run_with(backend, config).await
    } else {
        run_with(SystemSerial, config).await
    }
}

pub async fn run_with<B: SerialBackend>(backend: B, config: BridgeConfig) -> Result<(), BoxError> {
    let listener = TcpListener::bind(config.listen).await?;
    let bridge = Bridge::start(backend, listener, &config)?;

    shutdown_signal().await;
    info!("Shutting down");
    bridge.shutdown().await;
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let kinds = [
        SignalKind::interrupt(),
        SignalKind::terminate(),
        SignalKind::user_defined1(),
        SignalKind::user_defined2(),
    ];
    let mut streams = Vec::new();
    for kind in kinds {
        match signal(kind) {
            Ok(stream) => streams.push(stream),
            Err(e) => warn!("Cannot listen for signal {:?}: {}", kind, e),
        }
    }

    if streams.is_empty() {
        let _ = tokio::signal::ctrl_c().await;
        return;
    }

    let waits = streams.iter_mut().map(|s| Box::pin(s.recv()));
    futures_util::future::select_all(waits).await;
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PRODUCT_ID, VENDOR_ID};
    use crate::motor::link::{LinkConfig, LinkState, spawn};
    use crate::motor::protocol::{encode_slot, encode_stop_command};
    use std::net::SocketAddr;

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 4000))
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_uses_latest_target() {
        let backend = SimulatedSerial::new(VENDOR_ID, PRODUCT_ID);
        let (link, _task) = spawn(backend.clone(), LinkConfig::default());
        let sessions = SessionController::new(link.clone());
        let mut control = ControlLoop::new(sessions.targets(), link.clone());

        let token = sessions.open_session(peer());
        link.subscribe().wait_for(|s| *s == LinkState::Open).await.unwrap();

        sessions.handle_message(&token, r#"{"vs":[1.0,-1.0],"smoothing":0.1}"#);
        let out = control.tick();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!((out[0].unwrap() - 0.9).abs() < 1e-9);
        assert!((out[1].unwrap() + 0.9).abs() < 1e-9);
        assert_eq!(
            backend.take_lines(),
            vec![encode_slot(1, out[0]), encode_slot(2, out[1])]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_loss_stops_motors_then_closes() {
        let backend = SimulatedSerial::new(VENDOR_ID, PRODUCT_ID);
        let (link, _task) = spawn(backend.clone(), LinkConfig::default());
        let sessions = SessionController::new(link.clone());
        let control = ControlLoop::new(sessions.targets(), link.clone());
        tokio::spawn(control.run(Duration::from_millis(50)));

        let token = sessions.open_session(peer());
        sessions.handle_message(&token, r#"{"vs":[0.5,0.5]}"#);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(link.state(), LinkState::Open);

        sessions.close_session(token);
        assert_eq!(sessions.current_target().velocities, [None, None]);

        // 0.5 decays below 0.01 within three ticks at the default 0.25
        tokio::time::sleep(Duration::from_millis(200)).await;
        let lines = backend.take_lines();
        let tail = &lines[lines.len() - 2..];
        assert_eq!(tail, &[encode_stop_command(1), encode_stop_command(2)]);

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(link.state(), LinkState::Disconnected);
        assert_eq!(backend.closes(), 1);
    }
}
