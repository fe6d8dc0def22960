use stackrate::core::TileAssignment;
use stackrate::{ConcurrencyMode, RunRecord, StackConfig, StackError};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

const PYRATE_CONFIG: &str = "\
#------------------------------------
# input/output parameters
obsdir:         tests/test_data/small_test/gamma_obs/
ifgfilelist:    tests/test_data/small_test/gamma_obs/ifms_17
outdir:         out/gamma/out/

#------------------------------------
# stacking parameters
# pthr: minimum number of coherent ifg connections for each pixel
# nsig: n-sigma used as residuals threshold for iterativeLSQ stacking
# maxsig: maximum residual used as threshold for the stacking output
pthr:           5
nsig:           3
maxsig:         1000

#------------------------------------
# multiprocessing
parallel:       1
processes:      8
rows:           3
cols:           2
";

#[test]
fn test_read_config_file() -> anyhow::Result<()> {
    let mut file = NamedTempFile::new()?;
    file.write_all(PYRATE_CONFIG.as_bytes())?;

    let config = StackConfig::from_file(file.path())?;

    assert_eq!(config.mode, ConcurrencyMode::RowParallel);
    assert_eq!(config.processes, 8);
    assert_eq!(config.pthresh, 5);
    assert_eq!(config.nsig, 3.0);
    assert_eq!(config.max_sigma, 1000.0);
    assert_eq!(config.tile_grid, Some((3, 2)));
    assert_eq!(config.tile_assignment, TileAssignment::Block);
    Ok(())
}

#[test]
fn test_missing_config_file() {
    let result = StackConfig::from_file("/nonexistent/stackrate.conf");
    assert!(matches!(result, Err(StackError::Io(_))));
}

#[test]
fn test_distributed_keys() -> anyhow::Result<()> {
    let text = "parallel: 3\nprocesses: 4\ntileassignment: RoundRobin\ncommtimeout: 2.5\n";
    let config = StackConfig::from_config_str(text)?;

    assert_eq!(config.mode, ConcurrencyMode::Distributed);
    assert_eq!(config.tile_assignment, TileAssignment::RoundRobin);
    assert_eq!(config.collect_timeout, Duration::from_millis(2500));
    Ok(())
}

#[test]
fn test_run_record_written_to_file() -> anyhow::Result<()> {
    let config = StackConfig::from_config_str(PYRATE_CONFIG)?;
    let record = RunRecord::new(&config).with_inputs(vec!["a_unw.tif".to_string()]);

    let file = NamedTempFile::new()?;
    record.write_file(file.path())?;
    let written = std::fs::read_to_string(file.path())?;

    assert_eq!(written, record.render());
    assert!(written.contains("Coordinator found 8 worker processes."));

    // The echoed settings describe the same configuration
    let start = written.find("Config Settings: start\n").expect("start marker")
        + "Config Settings: start\n".len();
    let end = written.find("Config Settings: end").expect("end marker");
    assert_eq!(StackConfig::from_config_str(&written[start..end])?, config);
    Ok(())
}
