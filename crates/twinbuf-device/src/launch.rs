//! Launch geometry: grids of blocks (tiles) of threads

use crate::error::{DeviceError, Result};
use std::fmt;

/// Largest number of threads a single block may hold
pub const MAX_THREADS_PER_BLOCK: u32 = 1024;

/// Grid dimensions for kernel launch
///
/// Defines the 3D iteration space of blocks that execute the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GridDim {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl GridDim {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// Create 1D grid
    pub const fn linear(size: u32) -> Self {
        Self { x: size, y: 1, z: 1 }
    }

    /// Get total number of blocks
    pub const fn total_blocks(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }
}

impl Default for GridDim {
    fn default() -> Self {
        Self { x: 1, y: 1, z: 1 }
    }
}

impl fmt::Display for GridDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Block dimensions
///
/// Defines the 3D arrangement of threads within a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockDim {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl BlockDim {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// Create 1D block
    pub const fn linear(size: u32) -> Self {
        Self { x: size, y: 1, z: 1 }
    }

    /// Get total number of threads per block
    pub const fn total_threads(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }
}

impl Default for BlockDim {
    fn default() -> Self {
        Self { x: 1, y: 1, z: 1 }
    }
}

impl fmt::Display for BlockDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Launch configuration for kernel execution
///
/// Specifies the iteration space (grid × block).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Number of blocks in each dimension
    pub grid: GridDim,

    /// Number of threads per block in each dimension
    pub block: BlockDim,
}

impl LaunchConfig {
    pub const fn new(grid: GridDim, block: BlockDim) -> Self {
        Self { grid, block }
    }

    /// 1D configuration covering `total_elements` with blocks of `block_size`
    ///
    /// The grid is `ceil(total_elements / block_size)` blocks wide, so the
    /// last block may carry threads past the end of the data.
    pub const fn linear(total_elements: u32, block_size: u32) -> Self {
        let num_blocks = total_elements.div_ceil(block_size);
        Self {
            grid: GridDim::linear(num_blocks),
            block: BlockDim::linear(block_size),
        }
    }

    pub const fn total_blocks(&self) -> u64 {
        self.grid.total_blocks()
    }

    /// Total number of threads across all blocks
    pub const fn total_threads(&self) -> u64 {
        self.grid.total_blocks() * self.block.total_threads()
    }

    /// Reject configurations a device cannot run.
    ///
    /// Empty grids or blocks are invalid, as on real accelerators: callers
    /// skip the launch instead of issuing one with nothing to do.
    pub fn validate(&self) -> Result<()> {
        if self.grid.total_blocks() == 0 {
            return Err(DeviceError::InvalidLaunchConfig(format!("empty grid {}", self.grid)));
        }
        if self.block.total_threads() == 0 {
            return Err(DeviceError::InvalidLaunchConfig(format!("empty block {}", self.block)));
        }
        if self.block.total_threads() > MAX_THREADS_PER_BLOCK as u64 {
            return Err(DeviceError::InvalidLaunchConfig(format!(
                "block {} has {} threads, maximum is {}",
                self.block,
                self.block.total_threads(),
                MAX_THREADS_PER_BLOCK
            )));
        }
        Ok(())
    }
}

impl fmt::Display for LaunchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "grid={}, block={}", self.grid, self.block)
    }
}

/// Position of one thread within a launch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadContext {
    /// Block index within grid
    pub block_idx: (u32, u32, u32),

    /// Thread index within block
    pub thread_idx: (u32, u32, u32),

    pub grid_dim: GridDim,

    pub block_dim: BlockDim,
}

impl ThreadContext {
    pub const fn new(block_idx: (u32, u32, u32), thread_idx: (u32, u32, u32), grid_dim: GridDim, block_dim: BlockDim) -> Self {
        Self {
            block_idx,
            thread_idx,
            grid_dim,
            block_dim,
        }
    }

    /// Derive the context of the `thread`-th thread of the `block`-th block
    /// from their linear indices.
    pub fn from_linear(config: &LaunchConfig, block: u64, thread: u64) -> Self {
        let grid = config.grid;
        let blocks_per_slice = grid.x as u64 * grid.y as u64;
        let block_idx = (
            (block % grid.x as u64) as u32,
            ((block % blocks_per_slice) / grid.x as u64) as u32,
            (block / blocks_per_slice) as u32,
        );

        let dim = config.block;
        let threads_per_slice = dim.x as u64 * dim.y as u64;
        let thread_idx = (
            (thread % dim.x as u64) as u32,
            ((thread % threads_per_slice) / dim.x as u64) as u32,
            (thread / threads_per_slice) as u32,
        );

        Self::new(block_idx, thread_idx, grid, dim)
    }

    pub const fn block_linear_index(&self) -> u64 {
        let (bx, by, bz) = self.block_idx;
        (bz as u64 * self.grid_dim.y as u64 * self.grid_dim.x as u64) + (by as u64 * self.grid_dim.x as u64) + bx as u64
    }

    pub const fn thread_linear_index(&self) -> u64 {
        let (tx, ty, tz) = self.thread_idx;
        (tz as u64 * self.block_dim.y as u64 * self.block_dim.x as u64) + (ty as u64 * self.block_dim.x as u64) + tx as u64
    }

    /// Global linear index of this thread across the whole launch
    pub const fn global_linear_index(&self) -> u64 {
        self.block_linear_index() * self.block_dim.total_threads() + self.thread_linear_index()
    }
}
