use glam::Vec4;
use image::{ImageBuffer, Rgb, RgbImage, Rgba, RgbaImage};

use crate::texture::{GridTexture, HostTexture};

/// Resamples downloaded fields into images. Grid y grows upward, so the top image
/// row shows the last grid row.
pub struct Renderer {
    width: u32,
    height: u32,
    velocity_scale: f32,
}

impl Renderer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            velocity_scale: 1.0,
        }
    }

    /// Speed (cells per second) mapped to full channel intensity is `1 / scale`.
    pub fn with_velocity_scale(mut self, scale: f32) -> Self {
        self.velocity_scale = scale;
        self
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    fn grid_cell(&self, field: &HostTexture, x: u32, y: u32) -> Option<(u32, u32)> {
        let size = field.size();
        if size.is_empty() || self.width == 0 || self.height == 0 {
            return None;
        }
        let sim_x = (u64::from(x) * u64::from(size.width) / u64::from(self.width)) as u32;
        let sim_y = (u64::from(y) * u64::from(size.height) / u64::from(self.height)) as u32;
        (sim_x < size.width && sim_y < size.height).then(|| (sim_x, size.height - 1 - sim_y))
    }

    /// Premultiplied RGBA from the visualization buffer.
    pub fn render_visualization(&self, visualization: &HostTexture) -> RgbaImage {
        let mut img = ImageBuffer::new(self.width, self.height);

        for (x, y, pixel) in img.enumerate_pixels_mut() {
            *pixel = match self.grid_cell(visualization, x, y) {
                Some((sim_x, sim_y)) => {
                    let colour = visualization.get(sim_x, sim_y).clamp(Vec4::ZERO, Vec4::ONE);
                    Rgba((colour * 255.0).round().to_array().map(|channel| channel as u8))
                }
                None => Rgba([0, 0, 0, 0]),
            };
        }

        img
    }

    pub fn render_velocity_field(&self, velocity: &HostTexture) -> RgbImage {
        let mut img = ImageBuffer::new(self.width, self.height);

        for (x, y, pixel) in img.enumerate_pixels_mut() {
            *pixel = match self.grid_cell(velocity, x, y) {
                Some((sim_x, sim_y)) => {
                    let flow = velocity.vector(sim_x, sim_y) * self.velocity_scale;

                    // Red for x, green for y
                    let r = (flow.x.abs() * 255.0).min(255.0) as u8;
                    let g = (flow.y.abs() * 255.0).min(255.0) as u8;
                    Rgb([r, g, 128])
                }
                None => Rgb([0, 0, 0]),
            };
        }

        img
    }
}
