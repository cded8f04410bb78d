// Wheel kinematics for the two supported drivetrains
// Converts body-frame velocity commands to individual wheel angular speeds.
//
//  Differential                     Omnidirectional (three wheels)
//
//        y                            //_____________________\\
//        ^                           //           x           \\
//        |                             \  2       ^       1  /
//  2     @---->x    1                   \         |         /
// ||               ||  | R               \ y<-----@        /
// ||_______________||  |                   \      z      /
// ||               ||                       \    3     /
//         L                                   \_____/
//  <--------------->

use serde::{Deserialize, Serialize};

/// cos(60°) and cos(30°)
const C60: f32 = 0.500_000_000;
const C30: f32 = 0.866_025_404;

/// Wheel arrangement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// Two wheels on a common axle
    Differential,
    /// Three omni wheels at 0°, 120° and 240°
    Omni,
}

impl Topology {
    /// Number of wheels driven by this topology
    pub fn wheels(self) -> usize {
        match self {
            Topology::Differential => 2,
            Topology::Omni => 3,
        }
    }
}

/// Robot geometry used by the translator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriveParams {
    /// Wheel distance [m]
    pub wheel_distance: f32,
    /// Wheel radius [m]
    pub wheel_radius: f32,
    /// Per-wheel angular speed limit [rad/s], if the topology saturates
    pub max_wheel_speed: Option<f32>,
}

impl DriveParams {
    pub fn new(wheel_distance: f32, wheel_radius: f32) -> Self {
        Self {
            wheel_distance,
            wheel_radius,
            max_wheel_speed: None,
        }
    }

    /// Limit is symmetric, so only its magnitude counts
    pub fn with_max_wheel_speed(mut self, max: f32) -> Self {
        self.max_wheel_speed = Some(max.abs());
        self
    }
}

/// Body-frame velocity command, SI units
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VelocityCommand {
    pub forward: f32, // m/s
    pub strafe: f32,  // m/s
    pub angular: f32, // rad/s
}

impl VelocityCommand {
    /// Two degree-of-freedom command (no strafe)
    pub fn planar(forward: f32, angular: f32) -> Self {
        Self {
            forward,
            strafe: 0.0,
            angular,
        }
    }

    /// Three degree-of-freedom command
    pub fn holonomic(forward: f32, strafe: f32, angular: f32) -> Self {
        Self {
            forward,
            strafe,
            angular,
        }
    }

    pub fn zero() -> Self {
        Self::default()
    }
}

/// Per-wheel angular speed setpoints [rad/s]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WheelSetpoint {
    /// [left, right], unclamped
    Differential([f32; 2]),
    /// [w1, w2, w3], saturated and truncated
    Omni([i16; 3]),
}

impl WheelSetpoint {
    pub fn zero(topology: Topology) -> Self {
        match topology {
            Topology::Differential => WheelSetpoint::Differential([0.0; 2]),
            Topology::Omni => WheelSetpoint::Omni([0; 3]),
        }
    }

    pub fn topology(&self) -> Topology {
        match self {
            WheelSetpoint::Differential(_) => Topology::Differential,
            WheelSetpoint::Omni(_) => Topology::Omni,
        }
    }
}

/// Translate a velocity command into wheel setpoints for `topology`
///
/// The differential drive ignores `strafe`.
pub fn translate(topology: Topology, params: &DriveParams, cmd: &VelocityCommand) -> WheelSetpoint {
    match topology {
        Topology::Differential => WheelSetpoint::Differential(differential_wheel_speeds(params, cmd)),
        Topology::Omni => {
            let raw = omni_wheel_speeds(params, cmd);
            let max = params.max_wheel_speed.unwrap_or(f32::MAX);
            WheelSetpoint::Omni(raw.map(|dth| saturate(dth, max)))
        }
    }
}

/// Left and right wheel speeds. The right wheel is mounted mirrored, hence the sign.
pub fn differential_wheel_speeds(params: &DriveParams, cmd: &VelocityCommand) -> [f32; 2] {
    let inv_r = 1.0 / params.wheel_radius;
    let half_l = params.wheel_distance / 2.0;

    [
        inv_r * (cmd.forward + half_l * cmd.angular),
        -inv_r * (cmd.forward - half_l * cmd.angular),
    ]
}

/// Unclamped omni wheel speeds
pub fn omni_wheel_speeds(params: &DriveParams, cmd: &VelocityCommand) -> [f32; 3] {
    let r = params.wheel_radius;
    let dthz = -(params.wheel_distance / r) * cmd.angular;
    let dx12 = (C60 / r) * cmd.forward;
    let dy12 = (C30 / r) * cmd.strafe;

    [
        dx12 - dy12 + dthz,
        dx12 + dy12 + dthz,
        -(1.0 / r) * cmd.forward + dthz,
    ]
}

/// Clamp to [-max, max] and truncate toward zero
fn saturate(dth: f32, max: f32) -> i16 {
    // Plain comparisons: f32::clamp panics on a negative or NaN limit.
    // `as` saturates at the i16 range and maps NaN to 0
    let limited = if dth > max {
        max
    } else if dth < -max {
        -max
    } else {
        dth
    };
    limited as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diff() -> DriveParams {
        DriveParams::new(0.4, 0.05)
    }

    fn omni() -> DriveParams {
        DriveParams::new(0.16, 0.035).with_max_wheel_speed(52.0)
    }

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    #[test]
    fn test_differential_zero_velocity() {
        let sp = translate(Topology::Differential, &diff(), &VelocityCommand::zero());
        assert_eq!(sp, WheelSetpoint::Differential([0.0, 0.0]));
    }

    #[test]
    fn test_differential_forward() {
        let [left, right] = differential_wheel_speeds(&diff(), &VelocityCommand::planar(1.0, 0.0));
        assert!(approx(left, 20.0), "left = {}", left);
        assert!(approx(right, -20.0), "right = {}", right);
    }

    #[test]
    fn test_differential_rotation_spins_both_wheels_same_sign() {
        // Pure rotation: both wheels turn the same way because the right one is mirrored
        let [left, right] = differential_wheel_speeds(&diff(), &VelocityCommand::planar(0.0, 1.0));
        assert!(approx(left, 4.0));
        assert!(approx(right, 4.0));
    }

    #[test]
    fn test_differential_is_not_clamped() {
        let sp = translate(Topology::Differential, &diff(), &VelocityCommand::planar(100.0, 0.0));
        match sp {
            WheelSetpoint::Differential([left, _]) => assert!(left > 1000.0),
            other => panic!("unexpected setpoint {:?}", other),
        }
    }

    #[test]
    fn test_omni_zero_velocity() {
        let sp = translate(Topology::Omni, &omni(), &VelocityCommand::zero());
        assert_eq!(sp, WheelSetpoint::Omni([0, 0, 0]));
    }

    #[test]
    fn test_omni_forward() {
        // 0.035 m/s forward: w1 = w2 = 0.5, w3 = -1 before truncation
        let raw = omni_wheel_speeds(&omni(), &VelocityCommand::holonomic(0.035, 0.0, 0.0));
        assert!(approx(raw[0], 0.5));
        assert!(approx(raw[1], 0.5));
        assert!(approx(raw[2], -1.0));

        // 0.4 m/s: 5.71, 5.71, -11.43
        let sp = translate(Topology::Omni, &omni(), &VelocityCommand::holonomic(0.4, 0.0, 0.0));
        assert_eq!(sp, WheelSetpoint::Omni([5, 5, -11]));
    }

    #[test]
    fn test_omni_strafe_is_antisymmetric_on_front_wheels() {
        let raw = omni_wheel_speeds(&omni(), &VelocityCommand::holonomic(0.0, 0.1, 0.0));
        assert!(approx(raw[0], -raw[1]));
        assert!(approx(raw[2], 0.0));
    }

    #[test]
    fn test_omni_rotation_spins_all_wheels_equally() {
        let raw = omni_wheel_speeds(&omni(), &VelocityCommand::holonomic(0.0, 0.0, 1.0));
        let expected = -(0.16 / 0.035);
        for dth in raw {
            assert!(approx(dth, expected));
        }
    }

    #[test]
    fn test_omni_saturates_exactly_at_limit() {
        let sp = translate(Topology::Omni, &omni(), &VelocityCommand::holonomic(10.0, 0.0, 0.0));
        assert_eq!(sp, WheelSetpoint::Omni([52, 52, -52]));

        let sp = translate(Topology::Omni, &omni(), &VelocityCommand::holonomic(0.0, 0.0, -100.0));
        assert_eq!(sp, WheelSetpoint::Omni([52, 52, 52]));
    }

    #[test]
    fn test_saturate_never_wraps() {
        assert_eq!(saturate(1.0e9, f32::MAX), i16::MAX);
        assert_eq!(saturate(-1.0e9, f32::MAX), i16::MIN);
        assert_eq!(saturate(f32::NAN, 52.0), 0);
        assert_eq!(saturate(-3.9, 52.0), -3);
    }

    #[test]
    fn test_bad_limits_do_not_panic() {
        assert_eq!(saturate(10.0, f32::NAN), 10);

        let params = omni().with_max_wheel_speed(-52.0);
        assert_eq!(params.max_wheel_speed, Some(52.0));
        let sp = translate(Topology::Omni, &params, &VelocityCommand::holonomic(10.0, 0.0, 0.0));
        assert_eq!(sp, WheelSetpoint::Omni([52, 52, -52]));
    }

    #[test]
    fn test_zero_setpoint_matches_topology() {
        assert_eq!(WheelSetpoint::zero(Topology::Omni).topology(), Topology::Omni);
        assert_eq!(Topology::Differential.wheels(), 2);
        assert_eq!(Topology::Omni.wheels(), 3);
    }
}
