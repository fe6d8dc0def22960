use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};

/// Real-valued phase or rate sample
pub type StackReal = f32;

/// 2D real raster (rows x cols)
pub type RealImage = Array2<StackReal>;

/// 3D observation cube (observation x rows x cols)
pub type PhaseCube = Array3<StackReal>;

/// Per-pixel observation selection (observation x rows x cols)
pub type ObservationMask = Array3<bool>;

/// Temporal variance-covariance matrix (observation x observation)
pub type Vcm = Array2<f64>;

/// One interferogram: an unwrapped phase raster and the time it spans
#[derive(Debug, Clone)]
pub struct ObservationLayer {
    /// Phase values, NaN where no data is available
    pub phase: RealImage,
    /// Elapsed time between the two acquisitions (years)
    pub time_span: f64,
}

impl ObservationLayer {
    pub fn new(phase: RealImage, time_span: f64) -> Self {
        Self { phase, time_span }
    }

    pub fn shape(&self) -> (usize, usize) {
        self.phase.dim()
    }
}

/// Result of the stacking estimator for one pixel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelEstimate {
    /// Linear rate (velocity)
    pub rate: f64,
    /// Standard error of the rate
    pub error: f64,
    /// Number of observations behind the estimate
    pub samples: usize,
}

impl PixelEstimate {
    /// Estimate that carries no rate, only the sample statistic
    pub fn unresolved(samples: usize) -> Self {
        Self {
            rate: f64::NAN,
            error: f64::NAN,
            samples,
        }
    }

    pub fn is_resolved(&self) -> bool {
        !self.rate.is_nan()
    }
}

/// Full-raster stacking outputs
#[derive(Debug, Clone, PartialEq)]
pub struct RateMaps {
    pub rate: RealImage,
    pub error: RealImage,
    pub samples: RealImage,
}

impl RateMaps {
    /// Allocate NaN-filled rasters of the given shape
    pub fn empty(shape: (usize, usize)) -> Self {
        Self {
            rate: Array2::from_elem(shape, StackReal::NAN),
            error: Array2::from_elem(shape, StackReal::NAN),
            samples: Array2::from_elem(shape, StackReal::NAN),
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        self.rate.dim()
    }

    pub fn set(&mut self, row: usize, col: usize, estimate: &PixelEstimate) {
        self.rate[[row, col]] = estimate.rate as StackReal;
        self.error[[row, col]] = estimate.error as StackReal;
        self.samples[[row, col]] = estimate.samples as StackReal;
    }

    /// Number of pixels without a rate
    pub fn nan_pixel_count(&self) -> usize {
        self.rate.iter().filter(|v| v.is_nan()).count()
    }
}

/// Error types for stack rate processing
#[derive(Debug, thiserror::Error)]
pub enum StackError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Insufficient samples: {found} observations, {required} required")]
    InsufficientSamples { found: usize, required: usize },

    #[error("Numerical singularity: {0}")]
    NumericalSingularity(String),

    #[error("Distributed communication failure with rank {rank}: {reason}")]
    DistributedCommunication { rank: usize, reason: String },

    #[error("Thread pool error: {0}")]
    ThreadPool(String),

    #[error("Processing error: {0}")]
    Processing(String),
}

/// Result type for stack rate operations
pub type StackResult<T> = Result<T, StackError>;
