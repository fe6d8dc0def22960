use crate::types::{StackError, StackResult};
use serde::{Deserialize, Serialize};

/// Rectangular raster region; `bottom_right` is exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tile {
    /// Position in the row-major tile ordering
    pub index: usize,
    pub top_left: (usize, usize),
    pub bottom_right: (usize, usize),
}

impl Tile {
    pub fn rows(&self) -> std::ops::Range<usize> {
        self.top_left.0..self.bottom_right.0
    }

    pub fn cols(&self) -> std::ops::Range<usize> {
        self.top_left.1..self.bottom_right.1
    }

    pub fn shape(&self) -> (usize, usize) {
        (
            self.bottom_right.0 - self.top_left.0,
            self.bottom_right.1 - self.top_left.1,
        )
    }

    pub fn pixel_count(&self) -> usize {
        let (rows, cols) = self.shape();
        rows * cols
    }
}

/// How tiles are handed out to workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TileAssignment {
    /// Contiguous runs of tiles; earlier ranks take the remainder
    #[default]
    Block,
    /// Tile `i` goes to rank `i % workers`
    RoundRobin,
}

/// Deterministic partition of a raster into tiles.
///
/// The grid is a pure function of the raster shape and the worker count (or
/// an explicit grid), so every worker derives the same tiles locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileGrid {
    shape: (usize, usize),
    grid: (usize, usize),
    tiles: Vec<Tile>,
}

impl TileGrid {
    /// Grid with at least `workers` tiles where the raster allows it
    pub fn for_workers(shape: (usize, usize), workers: usize) -> StackResult<Self> {
        if workers == 0 {
            return Err(StackError::Configuration(
                "Tile grid requires at least one worker".to_string(),
            ));
        }

        let tile_rows = (workers as f64).sqrt().ceil() as usize;
        let tile_cols = (workers + tile_rows - 1) / tile_rows;
        let grid = Self::with_grid(shape, (tile_rows, tile_cols))?;

        if grid.len() < workers {
            log::warn!(
                "Raster {}x{} supports only {} tiles for {} workers",
                shape.0, shape.1, grid.len(), workers
            );
        }
        Ok(grid)
    }

    /// Grid of `tile_rows x tile_cols` tiles, clamped to the raster shape
    pub fn with_grid(shape: (usize, usize), grid: (usize, usize)) -> StackResult<Self> {
        let (rows, cols) = shape;
        if rows == 0 || cols == 0 {
            return Err(StackError::Configuration(format!(
                "Cannot tile an empty raster of shape {}x{}",
                rows, cols
            )));
        }
        if grid.0 == 0 || grid.1 == 0 {
            return Err(StackError::Configuration(format!(
                "Invalid tile grid {}x{}",
                grid.0, grid.1
            )));
        }

        let tile_rows = grid.0.min(rows);
        let tile_cols = grid.1.min(cols);
        let row_cuts = cuts(rows, tile_rows);
        let col_cuts = cuts(cols, tile_cols);

        let mut tiles = Vec::with_capacity(tile_rows * tile_cols);
        for r in 0..tile_rows {
            for c in 0..tile_cols {
                tiles.push(Tile {
                    index: tiles.len(),
                    top_left: (row_cuts[r], col_cuts[c]),
                    bottom_right: (row_cuts[r + 1], col_cuts[c + 1]),
                });
            }
        }

        log::debug!(
            "Tiled {}x{} raster into {}x{} grid ({} tiles)",
            rows, cols, tile_rows, tile_cols, tiles.len()
        );

        Ok(Self {
            shape,
            grid: (tile_rows, tile_cols),
            tiles,
        })
    }

    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    pub fn grid(&self) -> (usize, usize) {
        self.grid
    }

    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Tiles owned by `rank` out of `workers`
    pub fn assigned(&self, rank: usize, workers: usize, assignment: TileAssignment) -> Vec<Tile> {
        if workers == 0 || rank >= workers {
            return Vec::new();
        }

        match assignment {
            TileAssignment::Block => {
                let n = self.tiles.len();
                let base = n / workers;
                let extra = n % workers;
                let start = rank * base + rank.min(extra);
                let len = base + usize::from(rank < extra);
                self.tiles[start..start + len].to_vec()
            }
            TileAssignment::RoundRobin => self
                .tiles
                .iter()
                .filter(|tile| tile.index % workers == rank)
                .copied()
                .collect(),
        }
    }
}

/// Integer linspace boundaries splitting `extent` into `parts`
fn cuts(extent: usize, parts: usize) -> Vec<usize> {
    (0..=parts).map(|k| k * extent / parts).collect()
}
