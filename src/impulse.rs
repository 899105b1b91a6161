//! Per-frame impulses and the providers that produce them

use glam::Vec2;

use crate::grid::GridSize;

/// A transient velocity/density injection.
///
/// `position` is normalized to `[0, 1]²` with y growing upward, `radius` is in
/// grid cells.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Impulse {
    pub velocity: Vec2,
    pub position: Vec2,
    pub radius: f32,
}

impl Impulse {
    pub fn new(velocity: Vec2, position: Vec2, radius: f32) -> Self {
        Self {
            velocity,
            position,
            radius,
        }
    }

    /// Clamps the position into range and maps a non-positive radius to "no input".
    pub fn sanitized(self) -> Option<Self> {
        if !self.radius.is_finite() || self.radius <= 0.0 {
            return None;
        }
        let position = if self.position.is_finite() {
            self.position.clamp(Vec2::ZERO, Vec2::ONE)
        } else {
            Vec2::splat(0.5)
        };
        let velocity = if self.velocity.is_finite() {
            self.velocity
        } else {
            Vec2::ZERO
        };
        Some(Self {
            velocity,
            position,
            radius: self.radius,
        })
    }

    /// Cell nearest to the impulse position.
    pub fn target_cell(&self, grid: GridSize) -> (u32, u32) {
        let cell = (self.position * Vec2::new(grid.width as f32, grid.height as f32)).floor();
        grid.clamp_cell(cell.x as i64, cell.y as i64)
    }
}

/// Yields at most one impulse per frame.
pub trait SourceProvider {
    fn poll(&mut self, viewport: (u32, u32)) -> Option<Impulse>;
}

impl<F> SourceProvider for F
where
    F: FnMut((u32, u32)) -> Option<Impulse>,
{
    fn poll(&mut self, viewport: (u32, u32)) -> Option<Impulse> {
        self(viewport)
    }
}

/// An impulse delivered on the first poll only.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OneShot(pub Option<Impulse>);

impl SourceProvider for OneShot {
    fn poll(&mut self, _viewport: (u32, u32)) -> Option<Impulse> {
        self.0.take()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct PointerSample {
    position: Vec2,
    pressed: bool,
}

/// Turns pointer samples in window pixels (origin top-left) into impulses.
///
/// The host records the latest pointer state. Each poll reports the motion since
/// the previous poll, clamped to unit length, while the button is held. The
/// first poll of each press reports zero motion.
#[derive(Debug, Clone, Default)]
pub struct PointerSource {
    radius: f32,
    current: Option<PointerSample>,
    last_position: Option<Vec2>,
}

impl PointerSource {
    pub fn new(radius: f32) -> Self {
        Self {
            radius,
            current: None,
            last_position: None,
        }
    }

    pub fn record(&mut self, position: Vec2, pressed: bool) {
        self.current = Some(PointerSample { position, pressed });
    }

    pub fn set_radius(&mut self, radius: f32) {
        self.radius = radius;
    }
}

impl SourceProvider for PointerSource {
    fn poll(&mut self, viewport: (u32, u32)) -> Option<Impulse> {
        let sample = self.current?;
        if !sample.pressed {
            // A new drag starts from rest.
            self.last_position = None;
            return None;
        }
        let delta = sample.position - self.last_position.unwrap_or(sample.position);
        self.last_position = Some(sample.position);

        if viewport.0 == 0 || viewport.1 == 0 {
            return None;
        }

        // Window y points down, grid y points up.
        let velocity = Vec2::new(delta.x, -delta.y).clamp_length_max(1.0);
        let position = Vec2::new(
            sample.position.x / viewport.0 as f32,
            1.0 - sample.position.y / viewport.1 as f32,
        );
        Impulse::new(velocity, position, self.radius).sanitized()
    }
}
