//! Tile geometry: how a canvas maps onto a grid of panels.

use image::imageops::{self, FilterType};
use image::RgbImage;

/// Filter used when a bitmap has to be scaled to the canvas.
pub const CANVAS_FILTER: FilterType = FilterType::CatmullRom;

/// Fixed-size tiles on a `columns × rows` grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGeometry {
    pub tile_width: u32,
    pub tile_height: u32,
    pub columns: u32,
    pub rows: u32,
}

impl TileGeometry {
    pub fn new(tile_width: u32, tile_height: u32, columns: u32, rows: u32) -> Self {
        Self {
            tile_width,
            tile_height,
            columns,
            rows,
        }
    }

    /// A single tile.
    pub fn single(tile_width: u32, tile_height: u32) -> Self {
        Self::new(tile_width, tile_height, 1, 1)
    }

    /// Canvas size in pixels, saturating at `u32::MAX`.
    pub fn canvas_size(&self) -> (u32, u32) {
        (
            self.columns.saturating_mul(self.tile_width),
            self.rows.saturating_mul(self.tile_height),
        )
    }

    /// Top-left pixel of the tile at grid position `(grid_x, grid_y)`.
    pub fn tile_origin(&self, grid_x: u32, grid_y: u32) -> (u32, u32) {
        (
            grid_x.saturating_mul(self.tile_width),
            grid_y.saturating_mul(self.tile_height),
        )
    }

    /// Scales `image` to the canvas size unless it already matches.
    pub fn fit_canvas(&self, image: &RgbImage) -> RgbImage {
        let (width, height) = self.canvas_size();
        if image.dimensions() == (width, height) {
            return image.clone();
        }
        tracing::debug!(
            "Resizing {}x{} image to {}x{} canvas",
            image.width(),
            image.height(),
            width,
            height
        );
        imageops::resize(image, width, height, CANVAS_FILTER)
    }

    /// Cuts one tile out of a canvas-sized image.
    ///
    /// Parts of the tile that fall outside the image are black.
    pub fn crop_tile(&self, canvas: &RgbImage, grid_x: u32, grid_y: u32) -> RgbImage {
        let (x, y) = self.tile_origin(grid_x, grid_y);
        let region = imageops::crop_imm(canvas, x, y, self.tile_width, self.tile_height).to_image();
        if region.dimensions() == (self.tile_width, self.tile_height) {
            return region;
        }
        let mut tile = RgbImage::new(self.tile_width, self.tile_height);
        imageops::replace(&mut tile, &region, 0, 0);
        tile
    }
}
