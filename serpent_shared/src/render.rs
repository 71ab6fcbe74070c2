//! Rendering abstraction.
//!
//! This crate does not depend on a graphics backend. A drawing surface
//! implements [`RenderSurface`]; the match session calls it once per frame in
//! back-to-front order.

use crate::{math::Vec2, net::ConsumableState};

/// 24-bit RGB color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

/// Color of the locally predicted entity.
pub const LOCAL_COLOR: Color = Color::rgb(0x00, 0xff, 0x88);

/// Colors handed to remote entities in join order, cycling.
pub const PLAYER_PALETTE: [Color; 6] = [
    Color::rgb(0x00, 0xff, 0x88),
    Color::rgb(0xff, 0x44, 0x88),
    Color::rgb(0x44, 0xaa, 0xff),
    Color::rgb(0xff, 0xaa, 0x00),
    Color::rgb(0xaa, 0x44, 0xff),
    Color::rgb(0xff, 0x66, 0x44),
];

/// One row of the scoreboard or the final ranking.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreLine {
    pub name: String,
    pub score: u32,
    pub alive: bool,
    pub color: Color,
    pub local: bool,
}

/// Full-width notices drawn over the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Banner {
    /// The transport is not connected.
    Reconnecting,
    /// The local player is dead and watching.
    Spectating,
}

/// A drawing surface.
pub trait RenderSurface {
    fn begin_frame(&mut self, grid_width: i32, grid_height: i32);
    fn draw_grid(&mut self);
    fn draw_consumable(&mut self, consumable: &ConsumableState);
    fn draw_entity(&mut self, body: &[Vec2], color: Color, local: bool);
    fn draw_scoreboard(&mut self, lines: &[ScoreLine]);
    fn draw_banner(&mut self, banner: Banner);
    /// End-of-match overlay; `ranking` is already sorted.
    fn draw_final_ranking(&mut self, ranking: &[ScoreLine]);
    fn end_frame(&mut self);
}

/// A no-op surface for headless runs.
#[derive(Default)]
pub struct NullSurface;

impl RenderSurface for NullSurface {
    fn begin_frame(&mut self, _grid_width: i32, _grid_height: i32) {}
    fn draw_grid(&mut self) {}
    fn draw_consumable(&mut self, _consumable: &ConsumableState) {}
    fn draw_entity(&mut self, _body: &[Vec2], _color: Color, _local: bool) {}
    fn draw_scoreboard(&mut self, _lines: &[ScoreLine]) {}
    fn draw_banner(&mut self, _banner: Banner) {}
    fn draw_final_ranking(&mut self, _ranking: &[ScoreLine]) {}
    fn end_frame(&mut self) {}
}
