//! Grid allocation under a memory budget.
//!
//! A requested grid that does not fit is retried with every axis halved
//! until it fits or an axis reaches zero. Each retry is reported through a
//! callback before the next attempt.

use crate::{Error, Result};
use sysinfo::System;

/// Bytes per histogram cell.
pub const CELL_BYTES: usize = std::mem::size_of::<f32>();

/// Memory budget for histogram grids.
#[derive(Clone, Debug, PartialEq)]
pub struct MemoryBudget {
    /// Fraction of available system memory to allow (0.0 < fraction <= 1.0).
    pub memory_fraction: f64,
    /// Explicit budget in bytes. If set, `memory_fraction` is ignored.
    pub memory_budget_bytes: Option<usize>,
}

impl Default for MemoryBudget {
    fn default() -> Self {
        Self {
            memory_fraction: 0.5,
            memory_budget_bytes: None,
        }
    }
}

impl MemoryBudget {
    /// Set the fraction of available system memory to allow.
    #[must_use]
    pub fn with_memory_fraction(mut self, fraction: f64) -> Self {
        self.memory_fraction = fraction;
        self
    }

    /// Set an explicit budget in bytes.
    #[must_use]
    pub fn with_memory_budget_bytes(mut self, bytes: usize) -> Self {
        self.memory_budget_bytes = Some(bytes);
        self
    }

    /// Resolve the budget in bytes.
    ///
    /// # Errors
    /// Returns an error if the memory fraction is invalid or system memory
    /// cannot be queried.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn resolve_budget_bytes(&self) -> Result<usize> {
        if let Some(bytes) = self.memory_budget_bytes {
            return Ok(bytes);
        }
        if !(0.0 < self.memory_fraction && self.memory_fraction <= 1.0) {
            return Err(Error::InvalidBinning(
                "memory_fraction must be in (0.0, 1.0]".to_string(),
            ));
        }
        let mut system = System::new();
        system.refresh_memory();
        let available = system.available_memory();
        if available == 0 {
            return Err(Error::InvalidBinning(
                "available system memory reported as 0".to_string(),
            ));
        }
        let budget = (available as f64 * self.memory_fraction).floor() as u64;
        Ok(usize::try_from(budget).unwrap_or(usize::MAX))
    }
}

/// Bin counts along the three histogram axes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GridShape {
    /// Bins along the first edge (columns).
    pub nx: usize,
    /// Bins along the second edge (rows).
    pub ny: usize,
    /// Bins along the third edge (pages).
    pub nz: usize,
}

impl GridShape {
    /// Creates a shape.
    #[must_use]
    pub fn new(nx: usize, ny: usize, nz: usize) -> Self {
        Self { nx, ny, nz }
    }

    /// Total number of cells, or `None` on overflow.
    #[must_use]
    pub fn cells(&self) -> Option<usize> {
        self.nx.checked_mul(self.ny)?.checked_mul(self.nz)
    }

    /// Grid size in bytes, or `None` on overflow.
    #[must_use]
    pub fn bytes(&self) -> Option<usize> {
        self.cells()?.checked_mul(CELL_BYTES)
    }

    /// Every axis halved, or `None` once any axis would reach zero.
    #[must_use]
    pub fn halved(&self) -> Option<Self> {
        let next = Self::new(self.nx / 2, self.ny / 2, self.nz / 2);
        (next.nx > 0 && next.ny > 0 && next.nz > 0).then_some(next)
    }
}

impl std::fmt::Display for GridShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}x{}", self.nx, self.ny, self.nz)
    }
}

/// A failed allocation attempt, reported before the next, smaller one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocationRetry {
    /// Shape that could not be allocated.
    pub failed: GridShape,
    /// Shape that will be tried next.
    pub next: GridShape,
    /// Why the attempt failed.
    pub reason: String,
}

/// Allocates a zeroed grid of `shape` cells, halving on failure.
///
/// `budget_bytes` of `None` means only the allocator can refuse. Returns
/// the shape actually allocated with its cells.
///
/// # Errors
/// Returns [`Error::AllocationFailed`] if halving reaches a zero-sized
/// axis without a successful allocation.
pub fn allocate_grid(
    shape: GridShape,
    budget_bytes: Option<usize>,
    on_retry: &mut dyn FnMut(&AllocationRetry),
) -> Result<(GridShape, Vec<f32>)> {
    let mut shape = shape;
    loop {
        let reason = match try_allocate(shape, budget_bytes) {
            Ok(cells) => return Ok((shape, cells)),
            Err(reason) => reason,
        };
        let Some(next) = shape.halved() else {
            return Err(Error::AllocationFailed {
                nx: shape.nx,
                ny: shape.ny,
                nz: shape.nz,
                reason,
            });
        };
        log::warn!("Histogram grid {shape} not allocated ({reason}); retrying with {next}");
        on_retry(&AllocationRetry {
            failed: shape,
            next,
            reason,
        });
        shape = next;
    }
}

fn try_allocate(shape: GridShape, budget_bytes: Option<usize>) -> std::result::Result<Vec<f32>, String> {
    let (Some(cells), Some(bytes)) = (shape.cells(), shape.bytes()) else {
        return Err("size overflows the address space".to_string());
    };
    if cells == 0 {
        return Err("grid has a zero-sized axis".to_string());
    }
    if let Some(budget) = budget_bytes {
        if bytes > budget {
            return Err(format!("{bytes} bytes exceeds the {budget} byte budget"));
        }
    }
    let mut grid = Vec::new();
    grid.try_reserve_exact(cells)
        .map_err(|e| format!("allocator refused {bytes} bytes: {e}"))?;
    grid.resize(cells, 0.0);
    Ok(grid)
}
