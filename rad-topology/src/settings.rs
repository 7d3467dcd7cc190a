use config::{Config, ConfigError, Environment, File};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

lazy_static! {
    pub static ref SETTINGS: Settings = Settings::new().expect("invalid configuration");
}

const SETTINGS_PATH: &str = "./rad-topology.config.toml";
const PREFIX: &str = "RAD_TOPOLOGY";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root of the kernel's device tree, normally `/sys/devices/system`.
    pub sysfs_root: String,
    pub meminfo_path: String,
    pub use_hwloc: bool,
    pub region_dir: String,
    pub region_size: u64,
    pub region_touch_stride: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            sysfs_root: "/sys/devices/system".to_string(),
            meminfo_path: "/proc/meminfo".to_string(),
            use_hwloc: false,
            region_dir: "/dev/shm".to_string(),
            region_size: 8 * 1024 * 1024,
            region_touch_stride: 64 * std::mem::size_of::<u64>(),
        }
    }
}

impl Settings {
    fn new() -> Result<Settings, ConfigError> {
        Config::builder()
            .add_source(File::with_name(SETTINGS_PATH).required(false))
            .add_source(Environment::with_prefix(PREFIX))
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.sysfs_root, "/sys/devices/system");
        assert_eq!(settings.region_size, 8 << 20);
        assert_eq!(settings.region_touch_stride, 512);
        assert!(!settings.use_hwloc);
    }
}
