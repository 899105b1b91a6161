//! Grid geometry and compute dispatch extents

/// Work-group shape used by the compute kernels unless configured otherwise.
pub const WORKGROUP_SIZE: [u32; 2] = [8, 8];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GridSize {
    pub width: u32,
    pub height: u32,
}

impl GridSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Solver resolution for a viewport, downsampled by `2^lod`.
    pub fn from_viewport(width: u32, height: u32, lod: u32) -> Self {
        Self {
            width: width.checked_shr(lod).unwrap_or(0),
            height: height.checked_shr(lod).unwrap_or(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn cells(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// `W * H` as used by the diffusion weight.
    pub fn area(&self) -> f32 {
        self.width as f32 * self.height as f32
    }

    pub fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }

    /// Clamps a possibly out-of-grid cell coordinate to the nearest edge cell.
    pub fn clamp_cell(&self, x: i64, y: i64) -> (u32, u32) {
        let max_x = i64::from(self.width.saturating_sub(1));
        let max_y = i64::from(self.height.saturating_sub(1));
        (x.clamp(0, max_x) as u32, y.clamp(0, max_y) as u32)
    }
}

/// Work-group counts covering a grid.
///
/// The last group in each axis may hang past the grid edge. Kernels bound-check
/// every invocation against `grid`, never against the padded extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    pub grid: GridSize,
    pub workgroup: [u32; 2],
    pub groups: [u32; 2],
}

impl Dispatch {
    /// Returns `None` for an empty grid or a zero-sized work-group.
    pub fn for_grid(grid: GridSize, workgroup: [u32; 2]) -> Option<Self> {
        if grid.is_empty() || workgroup[0] == 0 || workgroup[1] == 0 {
            return None;
        }
        Some(Self {
            grid,
            workgroup,
            groups: [
                grid.width.div_ceil(workgroup[0]),
                grid.height.div_ceil(workgroup[1]),
            ],
        })
    }

    /// Extent actually launched, including the padding of partial groups.
    pub fn padded(&self) -> (u32, u32) {
        (
            self.groups[0] * self.workgroup[0],
            self.groups[1] * self.workgroup[1],
        )
    }

    pub fn invocations(&self) -> u64 {
        let (w, h) = self.padded();
        u64::from(w) * u64::from(h)
    }
}
