// Operator stick axes -> wheel velocities
//
// Axes are [lx, ly, rx, ry] in screen orientation (y grows downward).
// Each drive mode is a 2x4 matrix: wheel velocity i = sum over axes of
// axis * row_i[axis] * axis_scale[axis]. Per-axis scales are user-tunable
// per mode and can be saved to a JSON settings file.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::messages::WheelVelocities;

/// Stick axes [lx, ly, rx, ry]
pub type Axes = [f64; 4];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DriveMode {
    /// Left stick drives the left wheel, right stick the right wheel
    Tank,
    ForwardRight,
    ForwardLeft,
    OnlyRight,
    OnlyLeft,
}

impl DriveMode {
    pub const ALL: [DriveMode; 5] = [
        DriveMode::Tank,
        DriveMode::ForwardRight,
        DriveMode::ForwardLeft,
        DriveMode::OnlyRight,
        DriveMode::OnlyLeft,
    ];

    /// Per-wheel weights of each axis
    pub fn velocity_axis_scales(self) -> [Axes; 2] {
        match self {
            DriveMode::Tank => [[0.0, 1.0, 0.0, 0.0], [0.0, 0.0, 0.0, -1.0]],
            DriveMode::ForwardRight => [[-1.0, 0.0, 0.0, 1.0], [-1.0, 0.0, 0.0, -1.0]],
            DriveMode::ForwardLeft => [[0.0, 1.0, -1.0, 0.0], [0.0, -1.0, -1.0, 0.0]],
            DriveMode::OnlyRight => [[0.0, 0.0, -1.0, 1.0], [0.0, 0.0, -1.0, -1.0]],
            DriveMode::OnlyLeft => [[-1.0, 1.0, 0.0, 0.0], [-1.0, -1.0, 0.0, 0.0]],
        }
    }

    /// Axes this mode reads at all
    pub fn uses_axis(self, axis: usize) -> bool {
        self.velocity_axis_scales().iter().any(|row| row[axis] != 0.0)
    }

    pub fn next(self) -> Self {
        let i = Self::ALL.iter().position(|&m| m == self).unwrap_or(0);
        Self::ALL[(i + 1) % Self::ALL.len()]
    }

    pub fn name(self) -> &'static str {
        match self {
            DriveMode::Tank => "tank",
            DriveMode::ForwardRight => "forward-right",
            DriveMode::ForwardLeft => "forward-left",
            DriveMode::OnlyRight => "only-right",
            DriveMode::OnlyLeft => "only-left",
        }
    }
}

impl fmt::Display for DriveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DriveMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.name() == s)
            .ok_or_else(|| format!("unknown drive mode {:?}", s))
    }
}

/// Wheel velocities for the given stick state
///
/// `None` axes means no stick is touched, which releases both wheels.
pub fn axes_to_wheel_velocities(
    mode: DriveMode,
    axis_scales: &Axes,
    axes: Option<&Axes>,
) -> WheelVelocities {
    let Some(axes) = axes else {
        return [None, None];
    };

    mode.velocity_axis_scales().map(|row| {
        let sum = row
            .iter()
            .zip(axes)
            .zip(axis_scales)
            .map(|((weight, axis), scale)| axis * weight * scale)
            .sum::<f64>();
        Some(sum)
    })
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid settings file: {0}")]
    Json(#[from] serde_json::Error),
}

/// Active mode plus per-mode axis scales
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingSettings {
    pub active_mode: DriveMode,
    #[serde(default)]
    pub axis_scales: BTreeMap<DriveMode, Axes>,
}

impl Default for MappingSettings {
    fn default() -> Self {
        Self {
            active_mode: DriveMode::Tank,
            axis_scales: BTreeMap::new(),
        }
    }
}

impl MappingSettings {
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Axis scales for `mode` (all 1.0 unless changed)
    pub fn scales(&self, mode: DriveMode) -> Axes {
        self.axis_scales.get(&mode).copied().unwrap_or([1.0; 4])
    }

    pub fn set_scale(&mut self, axis: usize, value: f64) {
        let mode = self.active_mode;
        let mut scales = self.scales(mode);
        scales[axis] = value;
        self.axis_scales.insert(mode, scales);
    }

    pub fn wheel_velocities(&self, axes: Option<&Axes>) -> WheelVelocities {
        axes_to_wheel_velocities(self.active_mode, &self.scales(self.active_mode), axes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ONES: Axes = [1.0; 4];

    #[test]
    fn test_no_input_releases_wheels() {
        for mode in DriveMode::ALL {
            assert_eq!(axes_to_wheel_velocities(mode, &ONES, None), [None, None]);
        }
    }

    #[test]
    fn test_tank_mode() {
        // left stick pushed up (negative y), right stick pulled down
        let out = axes_to_wheel_velocities(DriveMode::Tank, &ONES, Some(&[0.3, -0.5, 0.2, 0.4]));
        assert_eq!(out, [Some(-0.5), Some(-0.4)]);
    }

    #[test]
    fn test_centered_sticks_give_zero_not_release() {
        let out = axes_to_wheel_velocities(DriveMode::OnlyLeft, &ONES, Some(&[0.0; 4]));
        assert_eq!(out, [Some(0.0), Some(0.0)]);
    }

    #[test]
    fn test_only_left_turns_in_place() {
        let out = axes_to_wheel_velocities(DriveMode::OnlyLeft, &ONES, Some(&[0.5, 0.0, 0.0, 0.0]));
        assert_eq!(out, [Some(-0.5), Some(-0.5)]);
    }

    #[test]
    fn test_axis_scales_apply() {
        let scales = [1.0, 2.0, 1.0, 0.5];
        let out = axes_to_wheel_velocities(DriveMode::Tank, &scales, Some(&[0.0, 0.5, 0.0, 1.0]));
        assert_eq!(out, [Some(1.0), Some(-0.5)]);
    }

    #[test]
    fn test_axis_usage() {
        assert!(!DriveMode::Tank.uses_axis(0));
        assert!(DriveMode::Tank.uses_axis(1));
        assert!(!DriveMode::Tank.uses_axis(2));
        assert!(DriveMode::Tank.uses_axis(3));
        assert!(!DriveMode::OnlyRight.uses_axis(1));
    }

    #[test]
    fn test_mode_names_round_trip() {
        for mode in DriveMode::ALL {
            assert_eq!(mode.name().parse::<DriveMode>(), Ok(mode));
        }
        assert!("sideways".parse::<DriveMode>().is_err());
        assert_eq!(DriveMode::OnlyLeft.next(), DriveMode::Tank);
    }

    #[test]
    fn test_settings_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let mut settings = MappingSettings {
            active_mode: DriveMode::ForwardLeft,
            ..Default::default()
        };
        settings.set_scale(2, 0.5);
        settings.save(&path).unwrap();

        let loaded = MappingSettings::load(&path).unwrap();
        assert_eq!(loaded, settings);
        assert_eq!(loaded.scales(DriveMode::ForwardLeft), [1.0, 1.0, 0.5, 1.0]);
        assert_eq!(loaded.scales(DriveMode::Tank), ONES);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            MappingSettings::load(&path),
            Err(SettingsError::Json(_))
        ));
    }
}
