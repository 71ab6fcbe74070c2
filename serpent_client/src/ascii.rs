//! Text rendering surface for terminals and tests.

use std::fmt::Write as _;

use serpent_shared::{
    math::Vec2,
    net::{ConsumableKind, ConsumableState},
    render::{Banner, Color, RenderSurface, ScoreLine},
};

/// Renders each frame into a block of text.
#[derive(Debug, Default)]
pub struct AsciiSurface {
    width: i32,
    height: i32,
    cells: Vec<char>,
    footer: Vec<String>,
    frame: String,
    frames: u64,
}

impl AsciiSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text of the last completed frame.
    pub fn frame(&self) -> &str {
        &self.frame
    }

    pub fn frames_drawn(&self) -> u64 {
        self.frames
    }

    fn put(&mut self, p: Vec2, c: char) {
        let (x, y) = (p.x.round() as i32, p.y.round() as i32);
        if x < 0 || y < 0 || x >= self.width || y >= self.height {
            return;
        }
        self.cells[(y * self.width + x) as usize] = c;
    }
}

impl RenderSurface for AsciiSurface {
    fn begin_frame(&mut self, grid_width: i32, grid_height: i32) {
        self.width = grid_width.max(0);
        self.height = grid_height.max(0);
        self.cells.clear();
        self.cells.resize((self.width * self.height) as usize, ' ');
        self.footer.clear();
    }

    fn draw_grid(&mut self) {
        self.cells.fill('.');
    }

    fn draw_consumable(&mut self, consumable: &ConsumableState) {
        let c = match consumable.kind {
            ConsumableKind::Normal => '*',
            ConsumableKind::Speed => '>',
            ConsumableKind::Golden => '$',
            ConsumableKind::Shrink => '-',
        };
        self.put(consumable.position, c);
    }

    fn draw_entity(&mut self, body: &[Vec2], _color: Color, local: bool) {
        let (head, seg) = if local { ('@', 'o') } else { ('X', 'x') };
        // Tail first so the head wins on overlap.
        for (i, p) in body.iter().enumerate().rev() {
            self.put(*p, if i == 0 { head } else { seg });
        }
    }

    fn draw_scoreboard(&mut self, lines: &[ScoreLine]) {
        for line in lines {
            let marker = if line.alive { ' ' } else { '+' };
            let who = if line.local { "you" } else { line.name.as_str() };
            self.footer.push(format!("{marker}{who}: {}", line.score));
        }
    }

    fn draw_banner(&mut self, banner: Banner) {
        self.footer.push(
            match banner {
                Banner::Reconnecting => "!! reconnecting...",
                Banner::Spectating => "-- spectating --",
            }
            .to_string(),
        );
    }

    fn draw_final_ranking(&mut self, ranking: &[ScoreLine]) {
        self.footer.push("== match over ==".to_string());
        for (i, line) in ranking.iter().enumerate() {
            let who = if line.local { "you" } else { line.name.as_str() };
            self.footer.push(format!("{}. {who}: {}", i + 1, line.score));
        }
    }

    fn end_frame(&mut self) {
        let mut out = String::with_capacity(self.cells.len() + self.height as usize + 64);
        for row in self.cells.chunks(self.width.max(1) as usize) {
            out.extend(row);
            out.push('\n');
        }
        for line in &self.footer {
            let _ = writeln!(out, "{line}");
        }
        self.frame = out;
        self.frames += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serpent_shared::render::LOCAL_COLOR;

    #[test]
    fn draws_entities_and_consumables() {
        let mut s = AsciiSurface::new();
        s.begin_frame(4, 2);
        s.draw_grid();
        s.draw_consumable(&ConsumableState {
            id: "f1".into(),
            position: Vec2::cell(3, 0),
            kind: ConsumableKind::Golden,
        });
        s.draw_entity(&[Vec2::cell(1, 1), Vec2::cell(0, 1)], LOCAL_COLOR, true);
        s.draw_entity(&[Vec2::new(9.0, 9.0)], LOCAL_COLOR, false);
        s.draw_banner(Banner::Spectating);
        s.end_frame();

        assert_eq!(s.frame(), "...$\no@..\n-- spectating --\n");
        assert_eq!(s.frames_drawn(), 1);
    }
}
