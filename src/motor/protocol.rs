// CAN-over-serial command encoding for the wheel motor controllers
//
// The USB adapter takes ASCII lines: `can send <ID> <PAYLOAD>\n`
// ID is the 16-bit bus id (big-endian hex), PAYLOAD is a register-write frame.
// Frames between 8 and 64 bytes must be a multiple of 4 long, padded with 0x50.

/// Length of the velocity frame
pub const VELOCITY_FRAME_LEN: usize = 24;

/// Filler byte for unused frame space
pub const PADDING: u8 = 0x50;

/// Payload that zeroes the mode register (motor off)
pub const STOP_PAYLOAD_HEX: &str = "010000";

/// Gain scale written alongside every velocity command
pub const GAIN_SCALE: f32 = 4.0;

/// Sub-write opcodes: upper bits select the type, low bits the register count
#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum WriteOp {
    Int8x1 = 0x01,  // 0x00 | 1
    Float32x2 = 0x0E, // 0x0C | 2
}

/// Controller registers touched by this bridge
#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum Register {
    Mode = 0x00,
    PositionCommand = 0x20, // followed by VelocityCommand (0x21)
    KpScale = 0x23,         // followed by KdScale (0x24)
}

/// Value written to the mode register before each velocity frame
pub const MODE_POSITION: u8 = 0x0A;

/// Build the 24-byte register-write frame for one velocity command
pub fn encode_velocity_payload(velocity: f32) -> [u8; VELOCITY_FRAME_LEN] {
    let mut frame = [PADDING; VELOCITY_FRAME_LEN];

    // mode <- position
    frame[0] = WriteOp::Int8x1 as u8;
    frame[1] = Register::Mode as u8;
    frame[2] = MODE_POSITION;

    // position, velocity (NaN position = no position target)
    frame[3] = WriteOp::Float32x2 as u8;
    frame[4] = Register::PositionCommand as u8;
    frame[5..9].copy_from_slice(&f32::NAN.to_le_bytes());
    frame[9..13].copy_from_slice(&velocity.to_le_bytes());

    // kp scale, kd scale
    frame[13] = WriteOp::Float32x2 as u8;
    frame[14] = Register::KpScale as u8;
    frame[15..19].copy_from_slice(&GAIN_SCALE.to_le_bytes());
    frame[19..23].copy_from_slice(&GAIN_SCALE.to_le_bytes());

    frame
}

/// Render bytes as uppercase hex
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

fn id_hex(motor_id: u16) -> String {
    to_hex(&motor_id.to_be_bytes())
}

/// Command line that drives `motor_id` at `velocity`
///
/// `velocity` must be finite; the caller validates it.
pub fn encode_velocity_command(motor_id: u16, velocity: f32) -> String {
    format!(
        "can send {} {}\n",
        id_hex(motor_id),
        to_hex(&encode_velocity_payload(velocity))
    )
}

/// Command line that switches `motor_id` off
pub fn encode_stop_command(motor_id: u16) -> String {
    format!("can send {} {}\n", id_hex(motor_id), STOP_PAYLOAD_HEX)
}

/// Encode one wheel slot: a present velocity drives, an absent one stops
pub fn encode_slot(motor_id: u16, velocity: Option<f64>) -> String {
    match velocity {
        Some(v) if v.is_finite() => encode_velocity_command(motor_id, v as f32),
        _ => encode_stop_command(motor_id),
    }
}

/// True for the adapter's routine "OK" acknowledgement
pub fn is_ack(data: &[u8]) -> bool {
    data.starts_with(b"OK")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_line(line: &str) -> (String, String) {
        let rest = line
            .strip_prefix("can send ")
            .and_then(|l| l.strip_suffix('\n'))
            .expect("command framing");
        let (id, payload) = rest.split_once(' ').expect("id and payload");
        (id.to_string(), payload.to_string())
    }

    #[test]
    fn test_velocity_frame_layout() {
        let frame = encode_velocity_payload(1.5);

        assert_eq!(&frame[0..3], &[0x01, 0x00, 0x0A]);
        assert_eq!(&frame[3..5], &[0x0E, 0x20]);
        assert!(f32::from_le_bytes(frame[5..9].try_into().unwrap()).is_nan());
        assert_eq!(f32::from_le_bytes(frame[9..13].try_into().unwrap()), 1.5);
        assert_eq!(&frame[13..15], &[0x0E, 0x23]);
        assert_eq!(&frame[15..19], &4.0f32.to_le_bytes());
        assert_eq!(&frame[19..23], &4.0f32.to_le_bytes());
        assert_eq!(frame[23], PADDING);
    }

    #[test]
    fn test_velocity_command_exact_bytes() {
        // 1.0f32 = 0x3F800000, NaN = 0x7FC00000, 4.0f32 = 0x40800000
        assert_eq!(
            encode_velocity_command(1, 1.0),
            "can send 0001 01000A0E200000C07F0000803F0E23000080400000804050\n"
        );
    }

    #[test]
    fn test_velocity_header_independent_of_value() {
        for v in [0.0f32, -0.0, 1e-6, -3.25, 1234.5, -98765.0] {
            let (id, payload) = parse_line(&encode_velocity_command(2, v));
            assert_eq!(id, "0002");
            assert_eq!(payload.len(), VELOCITY_FRAME_LEN * 2);
            assert_eq!(&payload[0..10], "01000A0E20");
            assert_eq!(&payload[10..18], "0000C07F");
            assert_eq!(&payload[26..48], "0E23000080400000804050");
            assert_eq!(payload, payload.to_uppercase());
        }
    }

    #[test]
    fn test_stop_command() {
        assert_eq!(encode_stop_command(1), "can send 0001 010000\n");
        assert_eq!(encode_stop_command(2), "can send 0002 010000\n");
        assert_eq!(encode_stop_command(0x1234), "can send 1234 010000\n");
    }

    #[test]
    fn test_slot_encoding() {
        assert_eq!(encode_slot(1, None), encode_stop_command(1));
        assert_eq!(encode_slot(1, Some(f64::NAN)), encode_stop_command(1));
        assert_eq!(encode_slot(2, Some(-0.5)), encode_velocity_command(2, -0.5));
    }

    #[test]
    fn test_ack_detection() {
        assert!(is_ack(b"OK\r\n"));
        assert!(is_ack(&[0x4F, 0x4B]));
        assert!(!is_ack(b"O"));
        assert!(!is_ack(b"ERR unknown"));
        assert!(!is_ack(b""));
    }
}
