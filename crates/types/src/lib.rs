//! Shared value types for the spline mapping and localization crates.

use serde::{Deserialize, Serialize};

/// 2D pose in world frame (meters, radians).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Pose {
    /// X position in meters (positive = forward at theta=0)
    pub x: f64,
    /// Y position in meters (positive = left at theta=0)
    pub y: f64,
    /// Heading in radians (positive = counter-clockwise from X axis)
    pub theta: f64,
}
