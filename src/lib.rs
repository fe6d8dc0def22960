//! stackrate: robust per-pixel InSAR stacking
//!
//! Estimates a linear deformation rate, its standard error and the number of
//! contributing observations for every pixel of an interferogram stack, using
//! iterative weighted least squares with outlier rejection. Pixels can be run
//! serially, on a local worker pool, or as tiles spread over cooperating
//! workers; all three produce the same rasters.

pub mod types;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use types::{
    ObservationLayer, PixelEstimate, RateMaps, StackError, StackResult,
    PhaseCube, ObservationMask, RealImage, Vcm,
};

pub use crate::core::{ObservationStack, PixelEstimator, StackRateEngine, StackRateOutput};
pub use io::{ConcurrencyMode, RunRecord, StackConfig};

#[cfg(feature = "python")]
mod python {
    use super::*;
    use numpy::{IntoPyArray, PyArray2, PyReadonlyArray2, PyReadonlyArray3};
    use pyo3::prelude::*;

    fn to_py_err(e: StackError) -> PyErr {
        match e {
            StackError::Configuration(_) => {
                PyErr::new::<pyo3::exceptions::PyValueError, _>(format!("{}", e))
            }
            _ => PyErr::new::<pyo3::exceptions::PyRuntimeError, _>(format!("{}", e)),
        }
    }

    /// Stack rate over a (observation, row, col) phase cube
    #[pyfunction]
    #[pyo3(signature = (
        phase, time_spans, vcm, mask = None,
        maxsig = 1000.0, nsig = 3.0, pthr = 3, parallel = 0, processes = 1
    ))]
    #[allow(clippy::too_many_arguments)]
    fn stack_rate<'py>(
        py: Python<'py>,
        phase: PyReadonlyArray3<'py, f32>,
        time_spans: Vec<f64>,
        vcm: PyReadonlyArray2<'py, f64>,
        mask: Option<PyReadonlyArray3<'py, bool>>,
        maxsig: f64,
        nsig: f64,
        pthr: usize,
        parallel: u8,
        processes: usize,
    ) -> PyResult<(&'py PyArray2<f32>, &'py PyArray2<f32>, &'py PyArray2<f32>)> {
        let config = StackConfig {
            mode: ConcurrencyMode::from_flag(parallel).map_err(to_py_err)?,
            processes,
            max_sigma: maxsig,
            nsig,
            pthresh: pthr,
            ..StackConfig::default()
        };
        let engine = StackRateEngine::new(config).map_err(to_py_err)?;

        let cube = phase.as_array().to_owned();
        let mask = mask.map(|m| m.as_array().to_owned());
        let vcm = vcm.as_array().to_owned();
        let stack = ObservationStack::from_cube(cube, time_spans, mask).map_err(to_py_err)?;

        let output = py
            .allow_threads(|| engine.run_stack(&stack, &vcm))
            .map_err(to_py_err)?;

        let maps = output.maps;
        Ok((
            maps.rate.into_pyarray(py),
            maps.error.into_pyarray(py),
            maps.samples.into_pyarray(py),
        ))
    }

    /// Python module definition
    #[pymodule]
    fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
        m.add_function(wrap_pyfunction!(stack_rate, m)?)?;
        Ok(())
    }
}
