//! Locally predicted entity.

use serpent_shared::{
    config::{Boundary, ClientConfig},
    math::{Direction, Vec2},
};

/// Result of one simulation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Moved,
    /// The head would have left the grid under [`Boundary::Walls`]; nothing moved.
    HitWall,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalEntity {
    /// Head first.
    body: Vec<Vec2>,
    direction: Direction,
    /// Steering applied on the next step.
    next_direction: Direction,
    /// A second turn made before the first was stepped.
    queued_turn: Option<Direction>,
    /// Positive: segments still to add. Negative: segments still to drop.
    grow_queue: i32,
}

impl LocalEntity {
    /// Three segments centred on the grid, facing right.
    pub fn spawn(cfg: &ClientConfig) -> Self {
        let head = Vec2::cell(cfg.grid_width / 2, cfg.grid_height / 2);
        Self {
            body: (0..3).map(|i| head.offset(-i, 0)).collect(),
            direction: Direction::Right,
            next_direction: Direction::Right,
            queued_turn: None,
            grow_queue: 0,
        }
    }

    pub fn from_body(body: Vec<Vec2>, direction: Direction) -> Self {
        Self {
            body,
            direction,
            next_direction: direction,
            queued_turn: None,
            grow_queue: 0,
        }
    }

    pub fn body(&self) -> &[Vec2] {
        &self.body
    }

    pub fn head(&self) -> Vec2 {
        self.body.first().copied().unwrap_or(Vec2::ZERO)
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn queued_growth(&self) -> i32 {
        self.grow_queue
    }

    /// Steers for the next step. Reversals and no-op turns are refused.
    ///
    /// While a turn is pending, one more turn is held for the step after it
    /// and checked against the pending heading.
    pub fn set_direction(&mut self, direction: Direction) -> bool {
        let (heading, pending) = if self.next_direction == self.direction {
            (self.direction, false)
        } else {
            (self.next_direction, true)
        };
        if direction == heading.opposite() || direction == heading {
            return false;
        }
        if pending {
            self.queued_turn = Some(direction);
        } else {
            self.next_direction = direction;
        }
        true
    }

    pub fn advance(&mut self, cfg: &ClientConfig) -> StepOutcome {
        let (dx, dy) = self.next_direction.delta();
        let mut head = self.head().offset(dx, dy);
        if !in_bounds(head, cfg) {
            match cfg.boundary {
                Boundary::Walls => return StepOutcome::HitWall,
                Boundary::Wrap => head = wrap(head, cfg),
            }
        }

        self.direction = self.next_direction;
        self.next_direction = self.queued_turn.take().unwrap_or(self.direction);
        self.body.insert(0, head);
        if self.grow_queue > 0 {
            self.grow_queue -= 1;
        } else {
            self.body.pop();
            if self.grow_queue < 0 {
                self.grow_queue += 1;
                if self.body.len() > 1 {
                    self.body.pop();
                }
            }
        }
        StepOutcome::Moved
    }

    /// Queues `amount` segments (negative shrinks).
    pub fn grow(&mut self, amount: i32) {
        self.grow_queue += amount;
    }

    /// Cancels up to `amount` of growth that has not been applied yet.
    /// Returns true if anything was cancelled.
    pub fn retract_growth(&mut self, amount: i32) -> bool {
        let before = self.grow_queue;
        if amount > 0 && self.grow_queue > 0 {
            self.grow_queue -= amount.min(self.grow_queue);
        } else if amount < 0 && self.grow_queue < 0 {
            self.grow_queue -= amount.max(self.grow_queue);
        }
        before != self.grow_queue
    }

    /// Hard correction: adopt the authoritative body wholesale.
    pub fn correct(&mut self, body: &[Vec2], direction: Direction) {
        self.body = body.to_vec();
        self.direction = direction;
        self.next_direction = direction;
        self.queued_turn = None;
        self.grow_queue = 0;
    }
}

fn in_bounds(p: Vec2, cfg: &ClientConfig) -> bool {
    p.x >= 0.0 && p.y >= 0.0 && p.x < cfg.grid_width as f32 && p.y < cfg.grid_height as f32
}

fn wrap(p: Vec2, cfg: &ClientConfig) -> Vec2 {
    Vec2::cell(
        (p.x as i32).rem_euclid(cfg.grid_width.max(1)),
        (p.y as i32).rem_euclid(cfg.grid_height.max(1)),
    )
}
