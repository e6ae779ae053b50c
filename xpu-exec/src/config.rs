//! Engine configuration.
//!
//! One immutable [`EngineConfig`] is handed to every session and executor. Defaults suit
//! tests; [`EngineConfig::from_env`] overlays `XPU_*` environment variables.

use std::env;

use xpu_expr::{BuildOptions, DevKind};
use xpu_result::{Error, Result};
use xpu_types::WARP_SIZE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Run scans on the device. When off, [`ScanExecutor`](crate::ScanExecutor) evaluates
    /// everything on the host.
    pub enabled: bool,
    /// Re-evaluate rows that raised a recoverable expression error on the host instead of
    /// failing the scan.
    pub cpu_fallback: bool,
    /// Keep diagnostics free of run-dependent numbers (launch and suspend counts).
    pub regression_test_mode: bool,
    pub device_kind: DevKind,
    pub allow_locale_aware: bool,
    /// Thread blocks per launch.
    pub grid_size: u32,
    /// Threads per block; a multiple of the warp size.
    pub block_size: u32,
    /// Variable-length bytes one row combination may hold in kvars.
    pub kvars_nbytes: usize,
    pub max_relaunches: u32,
    /// Rows a launch may defer to the host before the warps suspend.
    pub fallback_capacity: usize,
    /// Groups a warp keeps locally before flushing partial aggregates.
    pub preagg_local_groups: usize,
    /// Rooms of each destination chunk.
    pub dest_nrooms: u32,
    /// Body length of each destination chunk.
    pub dest_length: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cpu_fallback: false,
            regression_test_mode: false,
            device_kind: DevKind::GPU,
            allow_locale_aware: false,
            grid_size: 4,
            block_size: 64,
            kvars_nbytes: 2048,
            max_relaunches: 10_000,
            fallback_capacity: 1024,
            preagg_local_groups: 128,
            dest_nrooms: 4096,
            dest_length: 1 << 20,
        }
    }
}

fn parse_env_usize(key: &str) -> Result<Option<usize>> {
    match env::var(key) {
        Ok(s) => s
            .replace('_', "")
            .parse::<usize>()
            .map(Some)
            .map_err(|_| Error::InvalidArgumentError(format!("{key}={s} is not a number"))),
        Err(_) => Ok(None),
    }
}

fn parse_env_u32(key: &str) -> Result<Option<u32>> {
    match parse_env_usize(key)? {
        Some(v) => u32::try_from(v)
            .map(Some)
            .map_err(|_| Error::InvalidArgumentError(format!("{key}={v} is out of range"))),
        None => Ok(None),
    }
}

fn parse_env_bool01(key: &str) -> Result<Option<bool>> {
    match env::var(key) {
        Ok(s) => match s.as_str() {
            "1" | "true" | "TRUE" | "on" | "yes" | "YES" => Ok(Some(true)),
            "0" | "false" | "FALSE" | "off" | "no" | "NO" => Ok(Some(false)),
            _ => Err(Error::InvalidArgumentError(format!("{key}={s} is not a boolean"))),
        },
        Err(_) => Ok(None),
    }
}

fn parse_device_kind(s: &str) -> Option<DevKind> {
    match s.to_ascii_lowercase().as_str() {
        "gpu" => Some(DevKind::GPU),
        "dpu" => Some(DevKind::DPU),
        "host" | "cpu" => Some(DevKind::HOST),
        _ => None,
    }
}

impl EngineConfig {
    /// Defaults overlaid with `XPU_ENABLED`, `XPU_CPU_FALLBACK`, `XPU_REGRESSION_TEST_MODE`,
    /// `XPU_DEVICE_KIND`, `XPU_ALLOW_LOCALE_AWARE`, `XPU_GRID_SIZE`, `XPU_BLOCK_SIZE`,
    /// `XPU_KVARS_NBYTES`, `XPU_MAX_RELAUNCHES`, `XPU_FALLBACK_CAPACITY`,
    /// `XPU_PREAGG_LOCAL_GROUPS`, `XPU_DEST_NROOMS` and `XPU_DEST_LENGTH`.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(v) = parse_env_bool01("XPU_ENABLED")? {
            cfg.enabled = v;
        }
        if let Some(v) = parse_env_bool01("XPU_CPU_FALLBACK")? {
            cfg.cpu_fallback = v;
        }
        if let Some(v) = parse_env_bool01("XPU_REGRESSION_TEST_MODE")? {
            cfg.regression_test_mode = v;
        }
        if let Ok(s) = env::var("XPU_DEVICE_KIND") {
            cfg.device_kind = parse_device_kind(&s).ok_or_else(|| {
                Error::InvalidArgumentError(format!("XPU_DEVICE_KIND={s} is not gpu, dpu or host"))
            })?;
        }
        if let Some(v) = parse_env_bool01("XPU_ALLOW_LOCALE_AWARE")? {
            cfg.allow_locale_aware = v;
        }
        if let Some(v) = parse_env_u32("XPU_GRID_SIZE")? {
            cfg.grid_size = v;
        }
        if let Some(v) = parse_env_u32("XPU_BLOCK_SIZE")? {
            cfg.block_size = v;
        }
        if let Some(v) = parse_env_usize("XPU_KVARS_NBYTES")? {
            cfg.kvars_nbytes = v;
        }
        if let Some(v) = parse_env_u32("XPU_MAX_RELAUNCHES")? {
            cfg.max_relaunches = v;
        }
        if let Some(v) = parse_env_usize("XPU_FALLBACK_CAPACITY")? {
            cfg.fallback_capacity = v;
        }
        if let Some(v) = parse_env_usize("XPU_PREAGG_LOCAL_GROUPS")? {
            cfg.preagg_local_groups = v;
        }
        if let Some(v) = parse_env_u32("XPU_DEST_NROOMS")? {
            cfg.dest_nrooms = v;
        }
        if let Some(v) = parse_env_usize("XPU_DEST_LENGTH")? {
            cfg.dest_length = v;
        }
        cfg.validate()?;
        tracing::debug!("[CONFIG] {:?}", cfg);
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.grid_size == 0 {
            return Err(Error::InvalidArgumentError("grid_size must be positive".into()));
        }
        if self.block_size == 0 || self.block_size as usize % WARP_SIZE != 0 {
            return Err(Error::InvalidArgumentError(format!(
                "block_size {} is not a positive multiple of {WARP_SIZE}",
                self.block_size
            )));
        }
        if self.dest_nrooms == 0 || self.dest_length == 0 {
            return Err(Error::InvalidArgumentError(
                "destination chunks need rooms and bytes".into(),
            ));
        }
        if self.max_relaunches == 0 {
            return Err(Error::InvalidArgumentError("max_relaunches must be positive".into()));
        }
        if self.cpu_fallback && self.fallback_capacity == 0 {
            return Err(Error::InvalidArgumentError(
                "cpu_fallback needs a positive fallback_capacity".into(),
            ));
        }
        if self.preagg_local_groups == 0 {
            return Err(Error::InvalidArgumentError(
                "preagg_local_groups must be positive".into(),
            ));
        }
        if !DevKind::ANY.contains(self.device_kind) || self.device_kind.bits().count_ones() != 1 {
            return Err(Error::InvalidArgumentError(format!(
                "device_kind must name exactly one device, got {}",
                self.device_kind.name()
            )));
        }
        Ok(())
    }

    /// Warps per launch.
    #[inline]
    pub fn nwarps(&self) -> usize {
        self.grid_size as usize * self.block_size as usize / WARP_SIZE
    }

    pub fn build_options(&self) -> BuildOptions {
        BuildOptions {
            device: self.device_kind,
            allow_locale_aware: self.allow_locale_aware,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = EngineConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.nwarps(), 8);
        assert_eq!(cfg.build_options().device, DevKind::GPU);
    }

    #[test]
    fn block_size_must_be_warp_aligned() {
        let cfg = EngineConfig {
            block_size: 48,
            ..EngineConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::InvalidArgumentError(_))));
    }

    #[test]
    fn device_kind_names() {
        assert_eq!(parse_device_kind("DPU"), Some(DevKind::DPU));
        assert_eq!(parse_device_kind("cpu"), Some(DevKind::HOST));
        assert_eq!(parse_device_kind("tpu"), None);
    }
}
