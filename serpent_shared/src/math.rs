//! Grid math.
//!
//! Positions are grid cells. Authoritative and predicted bodies only ever hold
//! whole cells; fractional values appear in interpolated views.

use serde::{Deserialize, Serialize};

/// 2D grid position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Self = Self { x: 0.0, y: 0.0 };

    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// A whole-cell position.
    pub fn cell(x: i32, y: i32) -> Self {
        Self::new(x as f32, y as f32)
    }

    pub fn offset(self, dx: i32, dy: i32) -> Self {
        Self::new(self.x + dx as f32, self.y + dy as f32)
    }

    pub fn lerp(self, to: Self, t: f32) -> Self {
        let t = t.clamp(0.0, 1.0);
        Self::new(self.x + (to.x - self.x) * t, self.y + (to.y - self.y) * t)
    }

    /// Per-axis absolute distance.
    pub fn abs_diff(self, other: Self) -> (f32, f32) {
        ((self.x - other.x).abs(), (self.y - other.y).abs())
    }

    /// True if both positions name the same cell.
    pub fn same_cell(self, other: Self) -> bool {
        self.x.round() == other.x.round() && self.y.round() == other.y.round()
    }
}

/// Facing / steering direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Left,
    #[default]
    Right,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
            Direction::Left => Direction::Right,
            Direction::Right => Direction::Left,
        }
    }

    /// Cell delta for one step. `y` grows downwards.
    pub fn delta(self) -> (i32, i32) {
        match self {
            Direction::Up => (0, -1),
            Direction::Down => (0, 1),
            Direction::Left => (-1, 0),
            Direction::Right => (1, 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec2_lerp_midpoint() {
        let a = Vec2::new(0.0, 0.0);
        let b = Vec2::new(2.0, 4.0);
        assert_eq!(a.lerp(b, 0.5), Vec2::new(1.0, 2.0));
    }

    #[test]
    fn vec2_lerp_clamps() {
        let a = Vec2::cell(1, 1);
        let b = Vec2::cell(3, 1);
        assert_eq!(a.lerp(b, -2.0), a);
        assert_eq!(a.lerp(b, 7.0), b);
    }

    #[test]
    fn direction_opposites_and_deltas() {
        assert_eq!(Direction::Up.opposite(), Direction::Down);
        assert_eq!(Direction::Left.opposite(), Direction::Right);
        assert_eq!(Direction::Up.delta(), (0, -1));
        assert_eq!(Vec2::cell(5, 5).offset(1, 0), Vec2::cell(6, 5));
    }

    #[test]
    fn direction_wire_form_is_lowercase() {
        let s = serde_json::to_string(&Direction::Left).unwrap();
        assert_eq!(s, "\"left\"");
    }
}
