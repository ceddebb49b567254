// Keyboard teleop: WASD left stick, IJKL right stick, R/F speed, [/] smoothing, M mode, Q quit
use clap::Parser;
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use teleop_bridge::client::{ClientEvent, ReconnectingClient};
use teleop_bridge::config::DEFAULT_SMOOTHING;
use teleop_bridge::mapping::{Axes, DriveMode, MappingSettings};
use teleop_bridge::messages::{ControlMessage, WheelVelocities};

const SPEEDS: [f64; 3] = [0.25, 0.5, 1.0]; // stick deflection per level
const SMOOTHING_STEP: f64 = 0.05;
const INPUT_TIMEOUT_MS: u64 = 100; // Release sticks after this much time with no input
const SEND_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Parser)]
#[command(name = "teleop", about = "Drive the robot from the keyboard")]
struct TeleopArgs {
    /// Bridge WebSocket address
    #[arg(long, default_value = "ws://127.0.0.1:8777")]
    url: String,

    /// Drive mode (tank, forward-right, forward-left, only-right, only-left)
    #[arg(long)]
    mode: Option<DriveMode>,

    /// JSON file holding the active mode and axis scales
    #[arg(long)]
    settings: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args = TeleopArgs::parse();

    let mut settings = match &args.settings {
        Some(path) if path.exists() => MappingSettings::load(path)?,
        _ => MappingSettings::default(),
    };
    if let Some(mode) = args.mode {
        settings.active_mode = mode;
    }

    info!("Connecting to {}", args.url);
    info!("Controls: WASD/IJKL=sticks, R/F=speed, [/]=smoothing, M=mode, Q=quit");
    info!("Mode: {}", settings.active_mode);

    let (client, events) = ReconnectingClient::connect(args.url.clone());

    enable_raw_mode()?;
    let result = run_teleop(&client, events, &mut settings).await;
    disable_raw_mode()?;

    if let Some(path) = &args.settings {
        if let Err(e) = settings.save(path) {
            warn!("Failed to save settings to {}: {}", path.display(), e);
        }
    }

    result
}

async fn run_teleop(
    client: &ReconnectingClient,
    mut events: tokio::sync::mpsc::UnboundedReceiver<ClientEvent>,
    settings: &mut MappingSettings,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut speed_idx: usize = 0;
    let mut smoothing = DEFAULT_SMOOTHING;

    // Persistent stick state
    let mut axes: Axes = [0.0; 4];
    let mut last_input = Instant::now()
        .checked_sub(Duration::from_millis(INPUT_TIMEOUT_MS))
        .unwrap_or_else(Instant::now);

    let mut last_sent: Option<WheelVelocities> = None;
    let mut last_send_at = Instant::now();

    loop {
        while let Ok(event) = events.try_recv() {
            match event {
                ClientEvent::Open => {
                    info!("Connected");
                    // The bridge starts from defaults; push our state again
                    client.send(&ControlMessage {
                        vs: None,
                        smoothing: Some(smoothing),
                    });
                    last_sent = None;
                }
                ClientEvent::Closed => info!("Disconnected, retrying"),
                ClientEvent::Message(text) => info!("Bridge: {}", text),
            }
        }

        // Poll for key with 20ms timeout
        if event::poll(Duration::from_millis(20))? {
            if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                let pressed = kind == KeyEventKind::Press || kind == KeyEventKind::Repeat;
                let level = SPEEDS[speed_idx];

                let stick = match code {
                    KeyCode::Char('a') => Some((0, -level)),
                    KeyCode::Char('d') => Some((0, level)),
                    KeyCode::Char('w') => Some((1, -level)),
                    KeyCode::Char('s') => Some((1, level)),
                    KeyCode::Char('j') => Some((2, -level)),
                    KeyCode::Char('l') => Some((2, level)),
                    KeyCode::Char('i') => Some((3, -level)),
                    KeyCode::Char('k') => Some((3, level)),
                    _ => None,
                };

                if let Some((axis, value)) = stick.filter(|_| pressed) {
                    axes[axis] = value;
                    last_input = Instant::now();
                }

                match code {
                    _ if !pressed || stick.is_some() => {}

                    // Speed control
                    KeyCode::Char('r') => {
                        speed_idx = (speed_idx + 1).min(SPEEDS.len() - 1);
                        print_speed(speed_idx);
                    }
                    KeyCode::Char('f') => {
                        speed_idx = speed_idx.saturating_sub(1);
                        print_speed(speed_idx);
                    }

                    // Smoothing
                    KeyCode::Char('[') | KeyCode::Char(']') => {
                        let delta = if code == KeyCode::Char(']') {
                            SMOOTHING_STEP
                        } else {
                            -SMOOTHING_STEP
                        };
                        smoothing = (smoothing + delta).clamp(0.0, 0.95);
                        info!("Smoothing: {:.2}", smoothing);
                        client.send(&ControlMessage {
                            vs: None,
                            smoothing: Some(smoothing),
                        });
                    }

                    KeyCode::Char('m') => {
                        settings.active_mode = settings.active_mode.next();
                        info!("Mode: {}", settings.active_mode);
                    }

                    // Quit
                    KeyCode::Char('q') | KeyCode::Esc => break,

                    _ => {}
                }
            }
        }

        // Release sticks if no input for INPUT_TIMEOUT_MS
        let sticks = if last_input.elapsed() > Duration::from_millis(INPUT_TIMEOUT_MS) {
            axes = [0.0; 4];
            None
        } else {
            Some(&axes)
        };

        // Send at 10Hz, only on change
        if last_send_at.elapsed() >= SEND_INTERVAL {
            last_send_at = Instant::now();
            let vs = settings.wheel_velocities(sticks);
            if last_sent != Some(vs) && client.send(&wheel_message(vs)) {
                last_sent = Some(vs);
            }
        }
    }

    client.send(&wheel_message([None, None]));
    // Give the connection task a moment to flush the release
    tokio::time::sleep(Duration::from_millis(100)).await;

    Ok(())
}

fn wheel_message(vs: WheelVelocities) -> ControlMessage {
    ControlMessage {
        vs: Some(vs.to_vec()),
        smoothing: None,
    }
}

fn print_speed(idx: usize) {
    let label = ["LOW", "MED", "HIGH"][idx];
    info!("Speed: {}", label);
}
