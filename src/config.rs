use std::fs;
use std::path::Path;

use log::warn;
use thiserror::Error;

pub type BaseType = usize;

pub type Addr = BaseType;
pub type PageOff = BaseType;
pub type BlockId = BaseType;
pub type Counter = BaseType;

/// Bytes per flash page, only used for capacity reporting.
pub const PAGE_BYTES: BaseType = 4096;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: {detail}")]
    Parse { line: usize, detail: String },
    #[error("missing key {0}")]
    MissingKey(&'static str),
    #[error("bad geometry: {0}")]
    Geometry(String),
}

/// Device geometry and timing, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub ssd_size: BaseType,
    pub package_size: BaseType,
    pub die_size: BaseType,
    pub plane_size: BaseType,
    pub block_size: BaseType,
    pub block_erases: Counter,
    pub overprovisioning: f64,
    pub page_read_delay: f64,
    pub page_write_delay: f64,
    pub block_erase_delay: f64,
    pub log_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ssd_size: 1,
            package_size: 1,
            die_size: 1,
            plane_size: 64,
            block_size: 16,
            block_erases: 100,
            overprovisioning: 10.0,
            page_read_delay: 0.000_025,
            page_write_delay: 0.000_2,
            block_erase_delay: 0.001_5,
            log_file: "ftl.log".to_string(),
        }
    }
}

impl Config {
    /// Parse a whitespace-separated `KEY value` file. `#` starts a comment.
    /// Keys this simulator does not model (bus and RAM timing) are skipped
    /// with a warning.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let text = fs::read_to_string(path)?;
        let mut cfg = Config::default();
        let mut seen_geometry = [false; 7];

        for (idx, raw_line) in text.lines().enumerate() {
            let line = raw_line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let key = fields.next().unwrap_or("");
            let value = fields.next().ok_or_else(|| ConfigError::Parse {
                line: idx + 1,
                detail: format!("key {key} has no value"),
            })?;

            if key == "LOG_FILE" {
                cfg.log_file = value.to_string();
                continue;
            }

            let num: f64 = value.parse().map_err(|_| ConfigError::Parse {
                line: idx + 1,
                detail: format!("{key}: cannot parse {value:?} as a number"),
            })?;
            match key {
                "SSD_SIZE" => {
                    cfg.ssd_size = num as BaseType;
                    seen_geometry[0] = true;
                }
                "PACKAGE_SIZE" => {
                    cfg.package_size = num as BaseType;
                    seen_geometry[1] = true;
                }
                "DIE_SIZE" => {
                    cfg.die_size = num as BaseType;
                    seen_geometry[2] = true;
                }
                "PLANE_SIZE" => {
                    cfg.plane_size = num as BaseType;
                    seen_geometry[3] = true;
                }
                "BLOCK_SIZE" => {
                    cfg.block_size = num as BaseType;
                    seen_geometry[4] = true;
                }
                "BLOCK_ERASES" => {
                    cfg.block_erases = num as Counter;
                    seen_geometry[5] = true;
                }
                "OVERPROVISIONING" => {
                    cfg.overprovisioning = num;
                    seen_geometry[6] = true;
                }
                "PAGE_READ_DELAY" => cfg.page_read_delay = num,
                "PAGE_WRITE_DELAY" => cfg.page_write_delay = num,
                "BLOCK_ERASE_DELAY" => cfg.block_erase_delay = num,
                _ => warn!("config: skipping unmodeled key {key}"),
            }
        }

        const GEOMETRY_KEYS: [&str; 7] = [
            "SSD_SIZE",
            "PACKAGE_SIZE",
            "DIE_SIZE",
            "PLANE_SIZE",
            "BLOCK_SIZE",
            "BLOCK_ERASES",
            "OVERPROVISIONING",
        ];
        if let Some(missing) = seen_geometry.iter().position(|seen| !seen) {
            return Err(ConfigError::MissingKey(GEOMETRY_KEYS[missing]));
        }

        cfg.validated()
    }

    /// Sanity-check the geometry. Every structural size must be at least 1
    /// and the overprovision percentage must leave both a usable region and
    /// at least one spare block.
    pub fn validated(self) -> Result<Config, ConfigError> {
        let sizes = [
            self.ssd_size,
            self.package_size,
            self.die_size,
            self.plane_size,
            self.block_size,
        ];
        if sizes.iter().any(|&s| s == 0) {
            return Err(ConfigError::Geometry(
                "every geometry size must be at least 1".to_string(),
            ));
        }
        if self.block_erases == 0 {
            return Err(ConfigError::Geometry(
                "BLOCK_ERASES must be at least 1".to_string(),
            ));
        }
        if !(0.0..100.0).contains(&self.overprovisioning) {
            return Err(ConfigError::Geometry(format!(
                "OVERPROVISIONING {} out of [0, 100)",
                self.overprovisioning
            )));
        }
        if self.num_op_blocks() == 0 {
            return Err(ConfigError::Geometry(
                "overprovision region smaller than one block".to_string(),
            ));
        }
        if self.num_logical_blocks() == 0 {
            return Err(ConfigError::Geometry(
                "usable region smaller than one block".to_string(),
            ));
        }
        Ok(self)
    }

    /// Total pages in raw capacity.
    pub fn raw_pages(&self) -> Addr {
        self.ssd_size * self.package_size * self.die_size * self.plane_size * self.block_size
    }

    /// Overprovisioned pages, rounded down to a block multiple so the
    /// usable region stays block aligned.
    pub fn op_pages(&self) -> Addr {
        let raw_op = (self.raw_pages() as f64 * self.overprovisioning / 100.0) as Addr;
        raw_op - raw_op % self.block_size
    }

    /// Pages addressable by the host.
    pub fn usable_pages(&self) -> Addr {
        self.raw_pages() - self.op_pages()
    }

    pub fn num_logical_blocks(&self) -> BaseType {
        self.usable_pages() / self.block_size
    }

    pub fn num_physical_blocks(&self) -> BaseType {
        self.raw_pages() / self.block_size
    }

    pub fn num_op_blocks(&self) -> BaseType {
        self.op_pages() / self.block_size
    }
}
