use crate::core::distributed::{run_cluster, ClusterOptions};
use crate::core::estimator::PixelEstimator;
use crate::io::config::{ConcurrencyMode, StackConfig};
use crate::io::run_record::RunRecord;
use crate::types::{
    ObservationLayer, ObservationMask, PhaseCube, PixelEstimate, RateMaps, StackError, StackReal,
    StackResult, Vcm,
};
use ndarray::{s, Array3, Zip};

/// Zero-filled observation cube with time spans and the per-pixel selection mask
#[derive(Debug, Clone)]
pub struct ObservationStack {
    observations: PhaseCube,
    time_spans: Vec<f64>,
    mask: ObservationMask,
}

impl ObservationStack {
    /// Build the cube from interferogram layers
    pub fn new(layers: &[ObservationLayer], mask: Option<ObservationMask>) -> StackResult<Self> {
        let first = layers.first().ok_or_else(|| {
            StackError::Configuration("At least one observation layer is required".to_string())
        })?;
        let (rows, cols) = first.shape();

        for (k, layer) in layers.iter().enumerate() {
            if layer.shape() != (rows, cols) {
                return Err(StackError::Configuration(format!(
                    "Layer {} has shape {:?}, expected {:?}",
                    k,
                    layer.shape(),
                    (rows, cols)
                )));
            }
        }

        let cube = Array3::from_shape_fn((layers.len(), rows, cols), |(k, r, c)| {
            layers[k].phase[[r, c]]
        });
        let time_spans = layers.iter().map(|layer| layer.time_span).collect();

        Self::from_cube(cube, time_spans, mask)
    }

    /// Build from an observation cube that may contain NaN.
    ///
    /// Without a mask every non-NaN observation is selected. A supplied mask
    /// has its NaN observations cleared. NaN phases are then replaced by zero.
    pub fn from_cube(
        mut observations: PhaseCube,
        time_spans: Vec<f64>,
        mask: Option<ObservationMask>,
    ) -> StackResult<Self> {
        let (n_obs, rows, cols) = observations.dim();
        if n_obs == 0 || rows == 0 || cols == 0 {
            return Err(StackError::Configuration(format!(
                "Observation cube {}x{}x{} is empty",
                n_obs, rows, cols
            )));
        }
        if time_spans.len() != n_obs {
            return Err(StackError::Configuration(format!(
                "{} time spans for {} observations",
                time_spans.len(),
                n_obs
            )));
        }
        if let Some(k) = time_spans.iter().position(|t| !t.is_finite() || *t < 0.0) {
            return Err(StackError::Configuration(format!(
                "Observation {} has invalid time span {}",
                k, time_spans[k]
            )));
        }

        let mask = match mask {
            Some(mut mask) => {
                if mask.dim() != observations.dim() {
                    return Err(StackError::Configuration(format!(
                        "Mask shape {:?} does not match observations {:?}",
                        mask.dim(),
                        observations.dim()
                    )));
                }
                Zip::from(&mut mask)
                    .and(&observations)
                    .for_each(|selected, phase| *selected &= !phase.is_nan());
                mask
            }
            None => observations.mapv(|phase| !phase.is_nan()),
        };

        observations.mapv_inplace(|phase| if phase.is_nan() { 0.0 } else { phase });

        Ok(Self {
            observations,
            time_spans,
            mask,
        })
    }

    /// Raster shape (rows, cols)
    pub fn shape(&self) -> (usize, usize) {
        let (_, rows, cols) = self.observations.dim();
        (rows, cols)
    }

    pub fn observation_count(&self) -> usize {
        self.time_spans.len()
    }

    pub fn observations(&self) -> &PhaseCube {
        &self.observations
    }

    pub fn time_spans(&self) -> &[f64] {
        &self.time_spans
    }

    pub fn mask(&self) -> &ObservationMask {
        &self.mask
    }

    /// Indices of the observations selected for a pixel
    pub fn independent(&self, row: usize, col: usize) -> Vec<usize> {
        self.mask
            .slice(s![.., row, col])
            .iter()
            .enumerate()
            .filter_map(|(k, &selected)| selected.then_some(k))
            .collect()
    }

    pub fn estimate_pixel(
        &self,
        estimator: &PixelEstimator,
        vcm: &Vcm,
        row: usize,
        col: usize,
    ) -> PixelEstimate {
        let independent = self.independent(row, col);
        let phase: Vec<f64> = self
            .observations
            .slice(s![.., row, col])
            .iter()
            .map(|&v| v as f64)
            .collect();
        estimator.estimate(&independent, &self.time_spans, vcm, &phase)
    }

    /// Check that the VCM is a finite, symmetric `n_obs x n_obs` matrix
    pub fn validate_vcm(&self, vcm: &Vcm) -> StackResult<()> {
        let n = self.observation_count();
        let (vr, vc) = vcm.dim();
        if vr != vc {
            return Err(StackError::Configuration(format!(
                "VCM must be square, got {}x{}",
                vr, vc
            )));
        }
        if vr != n {
            return Err(StackError::Configuration(format!(
                "VCM is {}x{} but there are {} observations",
                vr, vc, n
            )));
        }
        if vcm.iter().any(|v| !v.is_finite()) {
            return Err(StackError::Configuration(
                "VCM contains non-finite values".to_string(),
            ));
        }
        for i in 0..n {
            for j in (i + 1)..n {
                let (a, b) = (vcm[[i, j]], vcm[[j, i]]);
                if (a - b).abs() > 1e-9 * (1.0 + a.abs().max(b.abs())) {
                    return Err(StackError::Configuration(format!(
                        "VCM is not symmetric at ({}, {})",
                        i, j
                    )));
                }
            }
        }
        Ok(())
    }
}

/// A way of running the pixel estimator over every pixel of a stack.
///
/// Implementations differ only in scheduling; all must produce the same rasters.
pub trait ExecutionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn execute(
        &self,
        stack: &ObservationStack,
        vcm: &Vcm,
        estimator: &PixelEstimator,
    ) -> StackResult<RateMaps>;
}

/// Row-major traversal on the calling thread
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialStrategy;

impl ExecutionStrategy for SerialStrategy {
    fn name(&self) -> &'static str {
        "serial"
    }

    fn execute(
        &self,
        stack: &ObservationStack,
        vcm: &Vcm,
        estimator: &PixelEstimator,
    ) -> StackResult<RateMaps> {
        let (rows, cols) = stack.shape();
        let mut maps = RateMaps::empty((rows, cols));
        for row in 0..rows {
            for col in 0..cols {
                let estimate = stack.estimate_pixel(estimator, vcm, row, col);
                maps.set(row, col, &estimate);
            }
        }
        Ok(maps)
    }
}

fn build_pool(threads: usize) -> StackResult<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .map_err(|e| StackError::ThreadPool(e.to_string()))
}

/// One task per raster row on a fixed-size worker pool
pub struct RowParallelStrategy {
    pool: rayon::ThreadPool,
}

impl RowParallelStrategy {
    pub fn new(threads: usize) -> StackResult<Self> {
        Ok(Self {
            pool: build_pool(threads)?,
        })
    }
}

impl ExecutionStrategy for RowParallelStrategy {
    fn name(&self) -> &'static str {
        "row-parallel"
    }

    fn execute(
        &self,
        stack: &ObservationStack,
        vcm: &Vcm,
        estimator: &PixelEstimator,
    ) -> StackResult<RateMaps> {
        self.execute_rows(stack, vcm, estimator)
    }
}

impl RowParallelStrategy {
    #[cfg(feature = "parallel")]
    fn execute_rows(
        &self,
        stack: &ObservationStack,
        vcm: &Vcm,
        estimator: &PixelEstimator,
    ) -> StackResult<RateMaps> {
        use rayon::prelude::*;

        let (rows, cols) = stack.shape();
        log::debug!(
            "Estimating {} rows on {} threads",
            rows,
            self.pool.current_num_threads()
        );

        let row_results: Vec<Vec<PixelEstimate>> = self.pool.install(|| {
            (0..rows)
                .into_par_iter()
                .map(|row| {
                    (0..cols)
                        .map(|col| stack.estimate_pixel(estimator, vcm, row, col))
                        .collect()
                })
                .collect()
        });

        let mut maps = RateMaps::empty((rows, cols));
        for (row, estimates) in row_results.iter().enumerate() {
            for (col, estimate) in estimates.iter().enumerate() {
                maps.set(row, col, estimate);
            }
        }
        Ok(maps)
    }

    #[cfg(not(feature = "parallel"))]
    fn execute_rows(
        &self,
        stack: &ObservationStack,
        vcm: &Vcm,
        estimator: &PixelEstimator,
    ) -> StackResult<RateMaps> {
        log::warn!("Built without the parallel feature, estimating rows serially");
        SerialStrategy.execute(stack, vcm, estimator)
    }
}

/// One task per pixel on a fixed-size worker pool
pub struct PixelParallelStrategy {
    pool: rayon::ThreadPool,
}

impl PixelParallelStrategy {
    pub fn new(threads: usize) -> StackResult<Self> {
        Ok(Self {
            pool: build_pool(threads)?,
        })
    }
}

impl ExecutionStrategy for PixelParallelStrategy {
    fn name(&self) -> &'static str {
        "pixel-parallel"
    }

    fn execute(
        &self,
        stack: &ObservationStack,
        vcm: &Vcm,
        estimator: &PixelEstimator,
    ) -> StackResult<RateMaps> {
        self.execute_pixels(stack, vcm, estimator)
    }
}

impl PixelParallelStrategy {
    #[cfg(feature = "parallel")]
    fn execute_pixels(
        &self,
        stack: &ObservationStack,
        vcm: &Vcm,
        estimator: &PixelEstimator,
    ) -> StackResult<RateMaps> {
        use rayon::prelude::*;

        let (rows, cols) = stack.shape();
        let indices: Vec<(usize, usize)> = (0..rows)
            .flat_map(|row| (0..cols).map(move |col| (row, col)))
            .collect();

        let estimates: Vec<PixelEstimate> = self.pool.install(|| {
            indices
                .par_iter()
                .map(|&(row, col)| stack.estimate_pixel(estimator, vcm, row, col))
                .collect()
        });

        let mut maps = RateMaps::empty((rows, cols));
        for (&(row, col), estimate) in indices.iter().zip(estimates.iter()) {
            maps.set(row, col, estimate);
        }
        Ok(maps)
    }

    #[cfg(not(feature = "parallel"))]
    fn execute_pixels(
        &self,
        stack: &ObservationStack,
        vcm: &Vcm,
        estimator: &PixelEstimator,
    ) -> StackResult<RateMaps> {
        log::warn!("Built without the parallel feature, estimating pixels serially");
        SerialStrategy.execute(stack, vcm, estimator)
    }
}

/// Tiles spread over a coordinator and cooperating workers
#[derive(Debug, Clone)]
pub struct DistributedStrategy {
    options: ClusterOptions,
}

impl DistributedStrategy {
    pub fn new(options: ClusterOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ClusterOptions {
        &self.options
    }
}

impl ExecutionStrategy for DistributedStrategy {
    fn name(&self) -> &'static str {
        "distributed"
    }

    fn execute(
        &self,
        stack: &ObservationStack,
        vcm: &Vcm,
        estimator: &PixelEstimator,
    ) -> StackResult<RateMaps> {
        run_cluster(stack, vcm, estimator, &self.options)
    }
}

/// Blank rate and error wherever the error exceeds `max_sigma`.
///
/// Sample counts are left as they are. Returns the number of pixels masked.
pub fn apply_max_sigma_mask(maps: &mut RateMaps, max_sigma: f64) -> usize {
    let mut masked = 0;
    Zip::from(&mut maps.rate)
        .and(&mut maps.error)
        .for_each(|rate, error| {
            if !error.is_nan() && (*error as f64) > max_sigma {
                *rate = StackReal::NAN;
                *error = StackReal::NAN;
                masked += 1;
            }
        });
    masked
}

/// Outputs of one engine run
#[derive(Debug, Clone)]
pub struct StackRateOutput {
    pub maps: RateMaps,
    /// Pixels blanked by the max-sigma mask
    pub masked_pixels: usize,
    /// Present for distributed runs; storage is up to the caller
    pub run_record: Option<RunRecord>,
}

/// Stack rate estimation over a full raster with a fixed execution strategy
pub struct StackRateEngine {
    config: StackConfig,
    estimator: PixelEstimator,
    strategy: Box<dyn ExecutionStrategy>,
}

impl StackRateEngine {
    /// Validate the configuration and select the strategy for its mode
    pub fn new(config: StackConfig) -> StackResult<Self> {
        config.validate()?;

        let strategy: Box<dyn ExecutionStrategy> = match config.mode {
            ConcurrencyMode::Serial => Box::new(SerialStrategy),
            ConcurrencyMode::RowParallel => Box::new(RowParallelStrategy::new(config.processes)?),
            ConcurrencyMode::PixelParallel => {
                Box::new(PixelParallelStrategy::new(config.processes)?)
            }
            ConcurrencyMode::Distributed => Box::new(DistributedStrategy::new(ClusterOptions {
                workers: config.processes,
                tile_grid: config.tile_grid,
                assignment: config.tile_assignment,
                timeout: config.collect_timeout,
            })),
        };

        Self::with_strategy(config, strategy)
    }

    /// Use a caller-supplied strategy instead of the one named by `config.mode`
    pub fn with_strategy(
        config: StackConfig,
        strategy: Box<dyn ExecutionStrategy>,
    ) -> StackResult<Self> {
        config.validate()?;
        let estimator = config.estimator();
        Ok(Self {
            config,
            estimator,
            strategy,
        })
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Estimate rates for a set of interferogram layers
    pub fn run(
        &self,
        layers: &[ObservationLayer],
        vcm: &Vcm,
        mask: Option<ObservationMask>,
    ) -> StackResult<StackRateOutput> {
        let stack = ObservationStack::new(layers, mask)?;
        self.run_stack(&stack, vcm)
    }

    pub fn run_stack(&self, stack: &ObservationStack, vcm: &Vcm) -> StackResult<StackRateOutput> {
        stack.validate_vcm(vcm)?;

        let run_record = match self.config.mode {
            ConcurrencyMode::Distributed => Some(RunRecord::new(&self.config)),
            _ => None,
        };

        let (rows, cols) = stack.shape();
        log::info!(
            "📈 Stack rate over {}x{} pixels, {} observations ({} strategy)",
            rows,
            cols,
            stack.observation_count(),
            self.strategy.name()
        );
        log::debug!("Stack parameters: {:?}", self.estimator);

        let mut maps = self.strategy.execute(stack, vcm, &self.estimator)?;
        if maps.shape() != (rows, cols) {
            return Err(StackError::Processing(format!(
                "Strategy {} produced {:?} rasters for a {:?} stack",
                self.strategy.name(),
                maps.shape(),
                (rows, cols)
            )));
        }

        let masked_pixels = apply_max_sigma_mask(&mut maps, self.config.max_sigma);
        log::info!(
            "Stack rate complete: {} of {} pixels without a rate ({} above max sigma {})",
            maps.nan_pixel_count(),
            rows * cols,
            masked_pixels,
            self.config.max_sigma
        );

        Ok(StackRateOutput {
            maps,
            masked_pixels,
            run_record,
        })
    }
}
