// Operator sessions: latest connection wins
//
// Every accepted connection gets a new epoch. Only the connection holding the
// current epoch may change the wheel targets; older ones stay connected but are
// ignored. When the active connection leaves, targets are cleared at once and
// the serial link starts its debounced close.
//
// Epoch changes, target writes and the matching link request happen under one
// lock, so the link sees connect and disconnect in the same order as the epochs.

use futures_util::StreamExt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::messages::{ControlMessage, ControlTarget};
use crate::motor::LinkHandle;

/// Proof of having been accepted as a session; only the newest one is authoritative
#[derive(Debug)]
pub struct SessionToken {
    epoch: u64,
    peer: SocketAddr,
}

impl SessionToken {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

#[derive(Debug)]
struct Authority {
    next_epoch: u64,
    active: Option<u64>,
}

pub struct SessionController {
    authority: Mutex<Authority>,
    targets: watch::Sender<ControlTarget>,
    link: LinkHandle,
}

impl SessionController {
    pub fn new(link: LinkHandle) -> Self {
        Self {
            authority: Mutex::new(Authority {
                next_epoch: 1,
                active: None,
            }),
            targets: watch::Sender::new(ControlTarget::default()),
            link,
        }
    }

    fn authority(&self) -> MutexGuard<'_, Authority> {
        self.authority.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot receiver for the tick loop
    pub fn targets(&self) -> watch::Receiver<ControlTarget> {
        self.targets.subscribe()
    }

    pub fn current_target(&self) -> ControlTarget {
        *self.targets.borrow()
    }

    /// Make a new connection the active session, demoting any previous one
    pub fn open_session(&self, peer: SocketAddr) -> SessionToken {
        let mut authority = self.authority();
        let epoch = authority.next_epoch;
        authority.next_epoch += 1;

        match authority.active.replace(epoch) {
            Some(previous) => info!("Session {} from {} replaces session {}", epoch, peer, previous),
            None => info!("Session {} from {} is active", epoch, peer),
        }

        self.link.connect();
        SessionToken { epoch, peer }
    }

    pub fn is_active(&self, token: &SessionToken) -> bool {
        self.authority().active == Some(token.epoch)
    }

    /// Apply a message from `token`; ignored unless that session is active
    pub fn handle_message(&self, token: &SessionToken, text: &str) {
        let authority = self.authority();
        if authority.active != Some(token.epoch) {
            debug!("Ignoring message from inactive session {}", token.epoch);
            return;
        }

        let msg = match ControlMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                error!("{} from {}", e, token.peer);
                return;
            }
        };

        let velocities = msg.wheel_velocities();
        let smoothing = msg.smoothing().filter(|&s| {
            let valid = (0.0..1.0).contains(&s);
            if !valid {
                warn!("Rejecting smoothing {} outside [0, 1)", s);
            }
            valid
        });

        if velocities.is_none() && smoothing.is_none() {
            return;
        }

        self.targets.send_modify(|target| {
            if let Some(velocities) = velocities {
                target.velocities = velocities;
            }
            if let Some(smoothing) = smoothing {
                target.smoothing = smoothing;
            }
        });
    }

    /// A connection ended; if it was active, stop the wheels and release the link
    pub fn close_session(&self, token: SessionToken) {
        let mut authority = self.authority();
        if authority.active != Some(token.epoch) {
            info!("Inactive session {} from {} disconnected", token.epoch, token.peer);
            return;
        }
        authority.active = None;

        info!("Session {} from {} disconnected", token.epoch, token.peer);
        self.targets
            .send_modify(|target| target.velocities = [None, None]);
        self.link.disconnect();
    }
}

/// Accept operator connections forever
pub async fn serve(listener: TcpListener, controller: Arc<SessionController>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                continue;
            }
        };
        let controller = controller.clone();
        tokio::spawn(async move {
            handle_connection(stream, peer, controller).await;
        });
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, controller: Arc<SessionController>) {
    let mut ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake with {} failed: {}", peer, e);
            return;
        }
    };
    info!("Connection from {}", peer);

    let token = controller.open_session(peer);

    while let Some(frame) = ws.next().await {
        match frame {
            Ok(Message::Text(text)) => controller.handle_message(&token, text.as_str()),
            Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                Ok(text) => controller.handle_message(&token, text),
                Err(e) => error!("Non UTF-8 binary message from {}: {}", peer, e),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("WebSocket error from {}: {}", peer, e);
                break;
            }
        }
    }

    controller.close_session(token);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PRODUCT_ID, VENDOR_ID};
    use crate::motor::link::{LinkConfig, LinkState, spawn};
    use crate::motor::sim::SimulatedSerial;
    use std::time::Duration;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn controller() -> (SessionController, LinkHandle, SimulatedSerial) {
        let backend = SimulatedSerial::new(VENDOR_ID, PRODUCT_ID);
        let (link, _task) = spawn(backend.clone(), LinkConfig::default());
        (SessionController::new(link.clone()), link, backend)
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_updates_targets() {
        let (sessions, _link, _backend) = controller();
        let a = sessions.open_session(peer(1));

        sessions.handle_message(&a, r#"{"vs":[0.5,null],"smoothing":0.1}"#);

        let target = sessions.current_target();
        assert_eq!(target.velocities, [Some(0.5), None]);
        assert_eq!(target.smoothing, 0.1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_session_wins() {
        let (sessions, _link, _backend) = controller();
        let a = sessions.open_session(peer(1));
        sessions.handle_message(&a, r#"{"vs":[1.0,1.0]}"#);

        let b = sessions.open_session(peer(2));
        assert!(!sessions.is_active(&a));
        assert!(sessions.is_active(&b));

        sessions.handle_message(&a, r#"{"vs":[-1.0,-1.0],"smoothing":0.9}"#);
        assert_eq!(sessions.current_target().velocities, [Some(1.0), Some(1.0)]);
        assert_eq!(sessions.current_target().smoothing, 0.25);

        sessions.handle_message(&b, r#"{"vs":[0.2,null]}"#);
        assert_eq!(sessions.current_target().velocities, [Some(0.2), None]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_demoted_session_close_keeps_targets() {
        let (sessions, link, _backend) = controller();
        let a = sessions.open_session(peer(1));
        let b = sessions.open_session(peer(2));
        sessions.handle_message(&b, r#"{"vs":[0.3,0.3]}"#);

        sessions.close_session(a);
        assert_eq!(sessions.current_target().velocities, [Some(0.3), Some(0.3)]);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(link.state(), LinkState::Open);
        assert!(sessions.is_active(&b));
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_close_clears_targets_and_debounces_link() {
        let (sessions, link, backend) = controller();
        let a = sessions.open_session(peer(1));
        sessions.handle_message(&a, r#"{"vs":[0.3,-0.3]}"#);
        link.subscribe().wait_for(|s| *s == LinkState::Open).await.unwrap();

        sessions.close_session(a);
        assert_eq!(sessions.current_target().velocities, [None, None]);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(link.state(), LinkState::Open);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(link.state(), LinkState::Disconnected);
        assert_eq!(backend.closes(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_racing_new_session_keeps_new_session_in_control() {
        let backend = SimulatedSerial::new(VENDOR_ID, PRODUCT_ID);
        let config = LinkConfig {
            disconnect_delay: Duration::from_millis(500),
            settle_delay: Duration::from_millis(1),
            ..LinkConfig::default()
        };
        let (link, _task) = spawn(backend.clone(), config);
        let sessions = SessionController::new(link.clone());

        let mut current = sessions.open_session(peer(1));
        link.subscribe().wait_for(|s| *s == LinkState::Open).await.unwrap();

        for i in 0..200u16 {
            let sessions = &sessions;
            let msg = format!(r#"{{"vs":[{0},{0}]}}"#, i);

            // Old connection closes while the next one arrives and sends
            let next = std::thread::scope(|scope| {
                let closing = scope.spawn(move || sessions.close_session(current));
                let opening = scope.spawn(|| {
                    let token = sessions.open_session(peer(2));
                    sessions.handle_message(&token, &msg);
                    token
                });
                closing.join().unwrap();
                opening.join().unwrap()
            });

            assert!(sessions.is_active(&next));
            let v = Some(f64::from(i));
            assert_eq!(sessions.current_target().velocities, [v, v]);
            current = next;
        }

        // A disconnect delivered after the newest connect would close the port by now
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(link.state(), LinkState::Open);
        assert_eq!(backend.closes(), 0);
        assert!(sessions.is_active(&current));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_message_keeps_targets() {
        let (sessions, _link, _backend) = controller();
        let a = sessions.open_session(peer(1));
        sessions.handle_message(&a, r#"{"vs":[0.4,0.4],"smoothing":0.3}"#);

        sessions.handle_message(&a, "{vs: nope");
        sessions.handle_message(&a, r#"{"vs":[1.0,"x"]}"#);
        sessions.handle_message(&a, r#"{"vs":[9.0]}"#);

        let target = sessions.current_target();
        assert_eq!(target.velocities, [Some(0.4), Some(0.4)]);
        assert_eq!(target.smoothing, 0.3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_smoothing_rejected() {
        let (sessions, _link, _backend) = controller();
        let a = sessions.open_session(peer(1));

        sessions.handle_message(&a, r#"{"smoothing":1.0}"#);
        sessions.handle_message(&a, r#"{"smoothing":-0.5}"#);
        assert_eq!(sessions.current_target().smoothing, 0.25);

        sessions.handle_message(&a, r#"{"smoothing":0.0,"vs":[1.0,2.0]}"#);
        assert_eq!(sessions.current_target().smoothing, 0.0);

        // The rest of the message still applies
        sessions.handle_message(&a, r#"{"smoothing":7,"vs":[null,null]}"#);
        let target = sessions.current_target();
        assert_eq!(target.smoothing, 0.0);
        assert_eq!(target.velocities, [None, None]);
    }
}
