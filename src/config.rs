// Defaults, timeouts, serial identity, and command-line overrides
use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

use crate::motor::link::LinkConfig;

// Control channel
pub const LISTEN_ADDR: &str = "0.0.0.0:8777";

// Control loop period (20 Hz)
pub const TICK_PERIOD: Duration = Duration::from_millis(50);

// Smoothing coefficient until an operator sets one
pub const DEFAULT_SMOOTHING: f64 = 0.25;

// Keep the port open this long after the last operator leaves
pub const DISCONNECT_DELAY: Duration = Duration::from_millis(2000);

// Time for the stop commands to reach the motors before closing
pub const SETTLE_DELAY: Duration = Duration::from_millis(200);

// Upper bound on the whole shutdown sequence
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

// USB CAN adapter (STMicroelectronics virtual COM port)
pub const VENDOR_ID: u16 = 0x0483;
pub const PRODUCT_ID: u16 = 0x5740;
pub const SERIAL_BAUDRATE: u32 = 115_200;

// Bus ids of the wheel motors, slot 0 then slot 1
pub const MOTOR_IDS: [u16; 2] = [1, 2];

/// Bridge settings after defaults and overrides are applied
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub listen: SocketAddr,
    pub tick_period: Duration,
    pub link: LinkConfig,
    /// Use the in-memory serial backend instead of hardware
    pub simulate: bool,
}

#[derive(Debug, Parser)]
#[command(name = "teleop-bridge", about = "Relay operator wheel commands to the motor CAN adapter")]
pub struct BridgeArgs {
    /// Address for operator WebSocket connections
    #[arg(long, default_value = LISTEN_ADDR)]
    pub listen: SocketAddr,

    /// Control loop period in milliseconds
    #[arg(long, default_value_t = TICK_PERIOD.as_millis() as u64)]
    pub tick_ms: u64,

    /// USB vendor id of the adapter (hex)
    #[arg(long, default_value = "0483", value_parser = parse_hex_u16)]
    pub vendor_id: u16,

    /// USB product id of the adapter (hex)
    #[arg(long, default_value = "5740", value_parser = parse_hex_u16)]
    pub product_id: u16,

    #[arg(long, default_value_t = SERIAL_BAUDRATE)]
    pub baud_rate: u32,

    /// Bus ids for the two wheels
    #[arg(long, num_args = 2, default_values_t = MOTOR_IDS.to_vec())]
    pub motor_ids: Vec<u16>,

    /// Grace period before closing the port after the operator leaves (ms)
    #[arg(long, default_value_t = DISCONNECT_DELAY.as_millis() as u64)]
    pub disconnect_delay_ms: u64,

    /// Delay between stop commands and closing the port (ms)
    #[arg(long, default_value_t = SETTLE_DELAY.as_millis() as u64)]
    pub settle_delay_ms: u64,

    /// Run without hardware
    #[arg(long)]
    pub simulate: bool,
}

/// Parse a USB id such as `0483` or `0x0483` (case-insensitive)
pub fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid hex id {:?}: {}", s, e))
}

impl From<BridgeArgs> for BridgeConfig {
    fn from(args: BridgeArgs) -> Self {
        let motor_ids = match args.motor_ids.as_slice() {
            &[a, b] => [a, b],
            _ => MOTOR_IDS,
        };

        Self {
            listen: args.listen,
            tick_period: Duration::from_millis(args.tick_ms),
            link: LinkConfig {
                vendor_id: args.vendor_id,
                product_id: args.product_id,
                baud_rate: args.baud_rate,
                motor_ids,
                disconnect_delay: Duration::from_millis(args.disconnect_delay_ms),
                settle_delay: Duration::from_millis(args.settle_delay_ms),
            },
            simulate: args.simulate,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeArgs::parse_from(["teleop-bridge"]).into()
    }
}
