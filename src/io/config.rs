use crate::core::estimator::PixelEstimator;
use crate::core::tiles::TileAssignment;
use crate::types::{StackError, StackResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// How pixels are scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConcurrencyMode {
    #[default]
    Serial,
    RowParallel,
    PixelParallel,
    Distributed,
}

impl ConcurrencyMode {
    /// Mode for the `parallel` configuration flag
    pub fn from_flag(flag: u8) -> StackResult<Self> {
        match flag {
            0 => Ok(ConcurrencyMode::Serial),
            1 => Ok(ConcurrencyMode::RowParallel),
            2 => Ok(ConcurrencyMode::PixelParallel),
            3 => Ok(ConcurrencyMode::Distributed),
            _ => Err(StackError::Configuration(format!(
                "Unknown parallel mode {}",
                flag
            ))),
        }
    }

    pub fn flag(&self) -> u8 {
        match self {
            ConcurrencyMode::Serial => 0,
            ConcurrencyMode::RowParallel => 1,
            ConcurrencyMode::PixelParallel => 2,
            ConcurrencyMode::Distributed => 3,
        }
    }
}

/// Stack rate configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackConfig {
    pub mode: ConcurrencyMode,
    /// Worker pool size, or worker count in distributed mode
    pub processes: usize,
    /// Rates with a larger standard error are blanked
    pub max_sigma: f64,
    /// Outlier threshold on whitened residuals
    pub nsig: f64,
    /// Minimum number of observations per pixel
    pub pthresh: usize,
    /// Explicit tile grid (tile rows, tile cols) for distributed runs
    pub tile_grid: Option<(usize, usize)>,
    pub tile_assignment: TileAssignment,
    /// Upper bound on any wait for another worker
    pub collect_timeout: Duration,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            mode: ConcurrencyMode::Serial,
            processes: 1,
            max_sigma: 1000.0,
            nsig: 3.0,
            pthresh: 3,
            tile_grid: None,
            tile_assignment: TileAssignment::Block,
            collect_timeout: Duration::from_secs(300),
        }
    }
}

impl StackConfig {
    pub fn estimator(&self) -> PixelEstimator {
        PixelEstimator::new(self.nsig, self.pthresh)
    }

    /// Reject configurations no run could succeed with
    pub fn validate(&self) -> StackResult<()> {
        if self.processes == 0 {
            return Err(StackError::Configuration(
                "processes must be at least 1".to_string(),
            ));
        }
        if !(self.nsig.is_finite() && self.nsig > 0.0) {
            return Err(StackError::Configuration(format!(
                "nsig must be positive, got {}",
                self.nsig
            )));
        }
        if !(self.max_sigma > 0.0) {
            return Err(StackError::Configuration(format!(
                "maxsig must be positive, got {}",
                self.max_sigma
            )));
        }
        if self.pthresh == 0 {
            return Err(StackError::Configuration(
                "pthr must be at least 1".to_string(),
            ));
        }
        if let Some((rows, cols)) = self.tile_grid {
            if rows == 0 || cols == 0 {
                return Err(StackError::Configuration(format!(
                    "Invalid tile grid {}x{}",
                    rows, cols
                )));
            }
        }
        if self.collect_timeout.is_zero() {
            return Err(StackError::Configuration(
                "commtimeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Read a `key: value` configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> StackResult<Self> {
        log::info!("Reading stack configuration: {}", path.as_ref().display());
        let text = std::fs::read_to_string(path)?;
        Self::from_config_str(&text)
    }

    /// Parse `key: value` lines, ignoring comments and unrelated keys
    pub fn from_config_str(text: &str) -> StackResult<Self> {
        let line_re = Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*:\s*(.*?)\s*$")
            .map_err(|e| StackError::Configuration(e.to_string()))?;

        let mut config = Self::default();
        let mut grid_rows = None;
        let mut grid_cols = None;

        for line in text.lines() {
            let line = line.split('#').next().unwrap_or_default();
            let Some(caps) = line_re.captures(line) else {
                continue;
            };
            let key = caps[1].to_ascii_lowercase();
            let value = &caps[2];
            if value.is_empty() {
                continue;
            }

            match key.as_str() {
                "parallel" => config.mode = ConcurrencyMode::from_flag(parse_value(&key, value)?)?,
                "processes" => config.processes = parse_value(&key, value)?,
                "maxsig" => config.max_sigma = parse_value(&key, value)?,
                "nsig" => config.nsig = parse_value(&key, value)?,
                "pthr" => config.pthresh = parse_value(&key, value)?,
                "rows" => grid_rows = Some(parse_value(&key, value)?),
                "cols" => grid_cols = Some(parse_value(&key, value)?),
                "tileassignment" => {
                    config.tile_assignment = match value.to_ascii_lowercase().as_str() {
                        "block" => TileAssignment::Block,
                        "roundrobin" => TileAssignment::RoundRobin,
                        other => {
                            return Err(StackError::Configuration(format!(
                                "Unknown tile assignment '{}'",
                                other
                            )))
                        }
                    }
                }
                "commtimeout" => {
                    let seconds: f64 = parse_value(&key, value)?;
                    config.collect_timeout = Duration::try_from_secs_f64(seconds).map_err(|e| {
                        StackError::Configuration(format!("commtimeout {}: {}", seconds, e))
                    })?;
                }
                _ => log::trace!("Ignoring configuration key '{}'", key),
            }
        }

        config.tile_grid = match (grid_rows, grid_cols) {
            (Some(rows), Some(cols)) => Some((rows, cols)),
            (None, None) => None,
            _ => {
                return Err(StackError::Configuration(
                    "rows and cols must be given together".to_string(),
                ))
            }
        };

        config.validate()?;
        log::debug!("Stack configuration: {:?}", config);
        Ok(config)
    }

    /// The effective configuration in `key: value` form
    pub fn to_config_text(&self) -> String {
        let mut text = String::new();
        let _ = writeln!(text, "parallel: {}", self.mode.flag());
        let _ = writeln!(text, "processes: {}", self.processes);
        let _ = writeln!(text, "maxsig: {}", self.max_sigma);
        let _ = writeln!(text, "nsig: {}", self.nsig);
        let _ = writeln!(text, "pthr: {}", self.pthresh);
        if let Some((rows, cols)) = self.tile_grid {
            let _ = writeln!(text, "rows: {}", rows);
            let _ = writeln!(text, "cols: {}", cols);
        }
        let assignment = match self.tile_assignment {
            TileAssignment::Block => "block",
            TileAssignment::RoundRobin => "roundrobin",
        };
        let _ = writeln!(text, "tileassignment: {}", assignment);
        let _ = writeln!(text, "commtimeout: {}", self.collect_timeout.as_secs_f64());
        text
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> StackResult<T> {
    value.parse().map_err(|_| {
        StackError::Configuration(format!("Invalid value '{}' for {}", value, key))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stack_keys() {
        let text = "\
# stacking parameters
obsdir:       tests/test_data/obs
parallel:     2
processes:    4
nsig:         2.5   # n-sigma
pthr:         5
maxsig:       2
";
        let config = StackConfig::from_config_str(text).unwrap();

        assert_eq!(config.mode, ConcurrencyMode::PixelParallel);
        assert_eq!(config.processes, 4);
        assert_eq!(config.nsig, 2.5);
        assert_eq!(config.pthresh, 5);
        assert_eq!(config.max_sigma, 2.0);
        assert_eq!(config.tile_grid, None);
    }

    #[test]
    fn test_missing_keys_use_defaults() {
        let config = StackConfig::from_config_str("outdir: out\n").unwrap();
        assert_eq!(config, StackConfig::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(StackConfig::from_config_str("nsig: abc\n").is_err());
        assert!(StackConfig::from_config_str("parallel: 7\n").is_err());
        assert!(StackConfig::from_config_str("pthr: 0\n").is_err());
        assert!(StackConfig::from_config_str("rows: 3\n").is_err());
        assert!(StackConfig::from_config_str("commtimeout: -1\n").is_err());
    }

    #[test]
    fn test_config_text_parses_back() {
        let config = StackConfig {
            mode: ConcurrencyMode::Distributed,
            processes: 3,
            max_sigma: 12.5,
            nsig: 2.0,
            pthresh: 4,
            tile_grid: Some((3, 2)),
            tile_assignment: TileAssignment::RoundRobin,
            collect_timeout: Duration::from_millis(1500),
        };

        let parsed = StackConfig::from_config_str(&config.to_config_text()).unwrap();
        assert_eq!(parsed, config);
    }
}
