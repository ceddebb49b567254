// Per-tick low-pass filter between operator targets and the motors
//
// Each tick moves the output toward the target by (1 - coefficient). A slot
// with no target that decays below STOP_EPSILON snaps to `None` so the motor
// gets a real stop command instead of an ever-shrinking velocity.

use crate::messages::WheelVelocities;

/// Magnitude below which an untargeted slot is considered stopped
pub const STOP_EPSILON: f64 = 0.01;

#[derive(Debug, Clone, Default)]
pub struct VelocitySmoother {
    smoothed: WheelVelocities,
}

impl VelocitySmoother {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance one tick toward `target` and return the new output
    pub fn step(&mut self, target: &WheelVelocities, coefficient: f64) -> WheelVelocities {
        for (out, target) in self.smoothed.iter_mut().zip(target) {
            let raw = target.unwrap_or(0.0);
            let value = out.unwrap_or(0.0) * coefficient + raw * (1.0 - coefficient);

            *out = if target.is_none() && value.abs() < STOP_EPSILON {
                None
            } else {
                Some(value)
            };
        }
        self.smoothed
    }

    pub fn current(&self) -> WheelVelocities {
        self.smoothed
    }
}
