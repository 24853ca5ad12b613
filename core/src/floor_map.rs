//! Occupancy model of a building floor decoded from a floor-plan image.
//!
//! Every pixel of the floor plan becomes one square cell of `resolution` world units. A cell is
//! walkable when its pixel is opaque enough (`alpha >= alpha_threshold`) and light enough
//! (luminance `>= occupied_threshold`); dark pixels are walls and transparent pixels lie outside
//! the building. Everything outside the image is blocked.
//!
//! Three queries are answered:
//! - [`FloorMap::is_walkable`]: point-in-free-space test.
//! - [`FloorMap::segment_blocked`]: whether a straight move crosses an obstacle. Particles move in
//!   discrete steps, so checking only the end point would let them hop through thin walls.
//! - [`FloorMap::clearance`]: distance to the nearest obstacle, from a chamfer distance transform
//!   computed once at decode time.
use image::RgbaImage;
use nalgebra::Point2;
use rand::Rng;
use std::fmt::{self, Debug};

use crate::config::FloorMapConfig;
use crate::error::{LocalizationError, Result};

const REJECTION_ATTEMPTS: usize = 32;

#[derive(Clone)]
pub struct FloorMap {
    width: u32,
    height: u32,
    resolution: f64,
    walkable: Vec<bool>,
    /// Distance in cells from each cell to the nearest blocked cell or the map border.
    clearance: Vec<f32>,
    walkable_cells: Vec<usize>,
}

impl Debug for FloorMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FloorMap")
            .field("pixels", &format_args!("{}x{}", self.width, self.height))
            .field("resolution", &self.resolution)
            .field("walkable_cells", &self.walkable_cells.len())
            .finish()
    }
}

impl FloorMap {
    /// Decode a floor-plan image (any format the `image` crate recognizes).
    pub fn decode(image_bytes: &[u8], config: &FloorMapConfig) -> Result<FloorMap> {
        let image = image::load_from_memory(image_bytes)
            .map_err(|e| LocalizationError::InvalidFloorMapImage(e.to_string()))?;
        FloorMap::from_rgba(&image.to_rgba8(), config)
    }

    /// Classify the pixels of an already decoded image.
    pub fn from_rgba(image: &RgbaImage, config: &FloorMapConfig) -> Result<FloorMap> {
        let walkable = image
            .pixels()
            .map(|pixel| {
                let [r, g, b, a] = pixel.0;
                let luminance = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
                a >= config.alpha_threshold && luminance >= config.occupied_threshold as f32
            })
            .collect();
        FloorMap::from_occupancy(image.width(), image.height(), walkable, config.resolution)
    }

    /// Build a map from a row-major walkability grid.
    pub fn from_occupancy(
        width: u32,
        height: u32,
        walkable: Vec<bool>,
        resolution: f64,
    ) -> Result<FloorMap> {
        if width == 0 || height == 0 {
            return Err(LocalizationError::InvalidFloorMapImage(
                "floor map image has no pixels".to_string(),
            ));
        }
        if walkable.len() != width as usize * height as usize {
            return Err(LocalizationError::InvalidFloorMapImage(format!(
                "occupancy grid has {} cells, expected {}x{}",
                walkable.len(),
                width,
                height
            )));
        }
        if !(resolution.is_finite() && resolution > 0.0) {
            return Err(LocalizationError::InvalidFloorMapImage(format!(
                "resolution must be positive, got {resolution}"
            )));
        }
        let walkable_cells: Vec<usize> = walkable
            .iter()
            .enumerate()
            .filter_map(|(i, &free)| free.then_some(i))
            .collect();
        if walkable_cells.is_empty() {
            return Err(LocalizationError::InvalidFloorMapImage(
                "floor map has no walkable area".to_string(),
            ));
        }
        let clearance = distance_transform(width as usize, height as usize, &walkable);
        Ok(FloorMap {
            width,
            height,
            resolution,
            walkable,
            clearance,
            walkable_cells,
        })
    }

    /// Width of the map in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height of the map in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    /// World extent `(width, height)` of the map.
    pub fn bounds(&self) -> (f64, f64) {
        (
            self.width as f64 * self.resolution,
            self.height as f64 * self.resolution,
        )
    }

    fn world_to_cell(&self, point: &Point2<f64>) -> Option<(i64, i64)> {
        if !point.x.is_finite() || !point.y.is_finite() {
            return None;
        }
        let cx = (point.x / self.resolution).floor();
        let cy = (point.y / self.resolution).floor();
        if cx < 0.0 || cy < 0.0 || cx >= self.width as f64 || cy >= self.height as f64 {
            None
        } else {
            Some((cx as i64, cy as i64))
        }
    }

    fn cell_is_walkable(&self, cx: i64, cy: i64) -> bool {
        if cx < 0 || cy < 0 || cx >= self.width as i64 || cy >= self.height as i64 {
            return false;
        }
        self.walkable[cy as usize * self.width as usize + cx as usize]
    }

    /// True when the point lies inside the map and on a walkable cell.
    pub fn is_walkable(&self, point: &Point2<f64>) -> bool {
        match self.world_to_cell(point) {
            Some((cx, cy)) => self.cell_is_walkable(cx, cy),
            None => false,
        }
    }

    /// True when the straight segment from `start` to `end` touches an obstacle or leaves the map.
    ///
    /// Cells are visited with Bresenham's line algorithm. A diagonal move between two cells is
    /// also blocked when both cells flanking the corner are blocked, so diagonal walls one pixel
    /// thick cannot be slipped through.
    pub fn segment_blocked(&self, start: &Point2<f64>, end: &Point2<f64>) -> bool {
        let (Some((mut x, mut y)), Some((end_x, end_y))) =
            (self.world_to_cell(start), self.world_to_cell(end))
        else {
            return true;
        };
        let dx = (end_x - x).abs();
        let dy = -(end_y - y).abs();
        let x_inc = if x < end_x { 1 } else { -1 };
        let y_inc = if y < end_y { 1 } else { -1 };
        let mut error = dx + dy;
        loop {
            if !self.cell_is_walkable(x, y) {
                return true;
            }
            if x == end_x && y == end_y {
                return false;
            }
            let doubled = 2 * error;
            let step_x = doubled >= dy;
            let step_y = doubled <= dx;
            if step_x && step_y
                && !self.cell_is_walkable(x + x_inc, y)
                && !self.cell_is_walkable(x, y + y_inc)
            {
                return true;
            }
            if step_x {
                error += dy;
                x += x_inc;
            }
            if step_y {
                error += dx;
                y += y_inc;
            }
        }
    }

    /// Distance (world units) from the point to the nearest obstacle; 0 off the walkable area.
    pub fn clearance(&self, point: &Point2<f64>) -> f64 {
        match self.world_to_cell(point) {
            Some((cx, cy)) if self.cell_is_walkable(cx, cy) => {
                self.clearance[cy as usize * self.width as usize + cx as usize] as f64
                    * self.resolution
            }
            _ => 0.0,
        }
    }

    /// Draw a point uniformly over the walkable area.
    ///
    /// Candidates are drawn uniformly over the map bounds and rejected until one is walkable. On
    /// sparse maps the draw falls back to a uniformly chosen walkable cell, which samples the same
    /// distribution.
    pub fn random_walkable_point<R: Rng + ?Sized>(&self, rng: &mut R) -> Point2<f64> {
        let (width, height) = self.bounds();
        for _ in 0..REJECTION_ATTEMPTS {
            let candidate = Point2::new(rng.random::<f64>() * width, rng.random::<f64>() * height);
            if self.is_walkable(&candidate) {
                return candidate;
            }
        }
        let index = self.walkable_cells[rng.random_range(0..self.walkable_cells.len())];
        let cx = (index % self.width as usize) as f64;
        let cy = (index / self.width as usize) as f64;
        Point2::new(
            (cx + rng.random::<f64>()) * self.resolution,
            (cy + rng.random::<f64>()) * self.resolution,
        )
    }
}

/// Two-pass chamfer distance transform (unit orthogonal, sqrt(2) diagonal steps).
///
/// Blocked cells have distance 0; the map border counts as an obstacle one cell beyond the edge.
fn distance_transform(width: usize, height: usize, walkable: &[bool]) -> Vec<f32> {
    const DIAGONAL: f32 = std::f32::consts::SQRT_2;
    let mut dist: Vec<f32> = (0..width * height)
        .map(|i| {
            if walkable[i] {
                let (x, y) = (i % width, i / width);
                (x + 1).min(y + 1).min(width - x).min(height - y) as f32
            } else {
                0.0
            }
        })
        .collect();

    for y in 0..height {
        for x in 0..width {
            let i = y * width + x;
            let mut d = dist[i];
            if x > 0 {
                d = d.min(dist[i - 1] + 1.0);
            }
            if y > 0 {
                d = d.min(dist[i - width] + 1.0);
                if x > 0 {
                    d = d.min(dist[i - width - 1] + DIAGONAL);
                }
                if x + 1 < width {
                    d = d.min(dist[i - width + 1] + DIAGONAL);
                }
            }
            dist[i] = d;
        }
    }
    for y in (0..height).rev() {
        for x in (0..width).rev() {
            let i = y * width + x;
            let mut d = dist[i];
            if x + 1 < width {
                d = d.min(dist[i + 1] + 1.0);
            }
            if y + 1 < height {
                d = d.min(dist[i + width] + 1.0);
                if x + 1 < width {
                    d = d.min(dist[i + width + 1] + DIAGONAL);
                }
                if x > 0 {
                    d = d.min(dist[i + width - 1] + DIAGONAL);
                }
            }
            dist[i] = d;
        }
    }
    dist
}
