use crate::lights::{DEFAULT_LUMINAIRES, LIGHT_STATE_PARAMETER};
use crate::replay::SelectionMode;
use crate::subscription::{DEFAULT_INSTANCE, DEFAULT_PROCESSOR};
use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_IMAGE_PARAMETERS: &[&str] = &[
    "/ViperGround/Images/ImageData/Hazcam_back_left_icer",
    "/ViperGround/Images/ImageData/Hazcam_back_right_icer",
    "/ViperGround/Images/ImageData/Hazcam_front_left_icer",
    "/ViperGround/Images/ImageData/Hazcam_front_right_icer",
    "/ViperGround/Images/ImageData/Navcam_left_icer",
    "/ViperGround/Images/ImageData/Navcam_right_icer",
    "/ViperGround/Images/ImageData/Aftcam_left_icer",
    "/ViperGround/Images/ImageData/Aftcam_right_icer",
];

const DEFAULT_YAMCS_URL: &str = "localhost:8090/yamcs";

#[derive(Debug, Clone)]
pub struct Config {
    pub mock: bool,
    pub yamcs_url: Option<String>,
    pub processor_path: (String, String),
    pub image_parameters: Vec<String>,
    pub light_parameters: Vec<String>,
    pub luminaires: Vec<String>,
    pub update_interval_ms: u64,
    pub reconnect_delay_ms: u64,

    pub product_dir: PathBuf,
    pub browse_dir: PathBuf,
    pub light_log_path: Option<PathBuf>,
    pub thumbnail_size: u32,

    pub replay_dir: Option<PathBuf>,
    pub replay_mode: SelectionMode,
    pub replay_seed: Option<u64>,
    pub replay_interval_ms: u64,

    pub database_url: Option<String>,
    pub db_pool_size: u32,
}

/// Typed reads over a key lookup, so configuration parses the same from the
/// process environment and from a map in tests.
struct Vars<F: Fn(&str) -> Option<String>> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn u64(&self, key: &str, default: u64) -> Result<u64> {
        match self.optional(key) {
            Some(raw) => raw.parse::<u64>().with_context(|| format!("invalid {key}")),
            None => Ok(default),
        }
    }

    fn bool(&self, key: &str, default: bool) -> Result<bool> {
        match self.optional(key) {
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(anyhow!("invalid {key}: expected a boolean, got {raw:?}")),
            },
            None => Ok(default),
        }
    }

    fn list(&self, key: &str, default: &[&str]) -> Vec<String> {
        match self.optional(key) {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .collect(),
            None => default.iter().map(|v| v.to_string()).collect(),
        }
    }
}

/// `instance/processor`
fn parse_processor_path(raw: &str) -> Result<(String, String)> {
    let (instance, processor) = raw
        .split_once('/')
        .ok_or_else(|| anyhow!("invalid ROVER_PROCESSOR_PATH {raw:?}: expected instance/processor"))?;
    let (instance, processor) = (instance.trim(), processor.trim());
    if instance.is_empty() || processor.is_empty() {
        return Err(anyhow!(
            "invalid ROVER_PROCESSOR_PATH {raw:?}: expected instance/processor"
        ));
    }
    Ok((instance.to_string(), processor.to_string()))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<Self> {
        let vars = Vars { lookup };

        let mock = vars.bool("ROVER_MOCK", false)?;
        let yamcs_url = Some(vars.string("ROVER_YAMCS_URL", DEFAULT_YAMCS_URL));
        let processor_path = parse_processor_path(&vars.string(
            "ROVER_PROCESSOR_PATH",
            &format!("{DEFAULT_INSTANCE}/{DEFAULT_PROCESSOR}"),
        ))?;
        let image_parameters = vars.list("ROVER_IMAGE_PARAMETERS", DEFAULT_IMAGE_PARAMETERS);
        let light_parameters = vars.list("ROVER_LIGHT_PARAMETERS", &[LIGHT_STATE_PARAMETER]);
        let luminaires = vars.list("ROVER_LUMINAIRES", DEFAULT_LUMINAIRES);
        let update_interval_ms = vars.u64("ROVER_UPDATE_INTERVAL_MS", 500)?;
        let reconnect_delay_ms = vars.u64("ROVER_RECONNECT_DELAY_MS", 2000)?;

        let product_dir = PathBuf::from(vars.string("ROVER_PRODUCT_DIR", "data/products"));
        let browse_dir = PathBuf::from(vars.string("ROVER_BROWSE_DIR", "data/browse"));
        let light_log_path = match (vars.lookup)("ROVER_LIGHT_LOG") {
            // explicitly empty disables the log
            Some(raw) if raw.trim().is_empty() => None,
            Some(raw) => Some(PathBuf::from(raw.trim())),
            None => Some(PathBuf::from("logs/lightstate.csv")),
        };
        let thumbnail_size = vars.u64("ROVER_THUMBNAIL_SIZE", 240)? as u32;

        let replay_dir = vars.optional("ROVER_REPLAY_DIR").map(PathBuf::from);
        let replay_mode = vars
            .string("ROVER_REPLAY_MODE", SelectionMode::Sequential.as_str())
            .parse::<SelectionMode>()
            .context("invalid ROVER_REPLAY_MODE")?;
        let replay_seed = match vars.optional("ROVER_REPLAY_SEED") {
            Some(raw) => Some(raw.parse::<u64>().context("invalid ROVER_REPLAY_SEED")?),
            None => None,
        };
        let replay_interval_ms = vars.u64("ROVER_REPLAY_INTERVAL_MS", 1000)?;

        let database_url = vars
            .optional("ROVER_DATABASE_URL")
            .or_else(|| vars.optional("DATABASE_URL"));
        let db_pool_size = vars.u64("ROVER_DB_POOL_SIZE", 5)? as u32;

        if thumbnail_size == 0 {
            return Err(anyhow!("ROVER_THUMBNAIL_SIZE must be positive"));
        }

        Ok(Self {
            mock,
            yamcs_url,
            processor_path,
            image_parameters,
            light_parameters,
            luminaires,
            update_interval_ms,
            reconnect_delay_ms,
            product_dir,
            browse_dir,
            light_log_path,
            thumbnail_size,
            replay_dir,
            replay_mode,
            replay_seed,
            replay_interval_ms,
            database_url,
            db_pool_size,
        })
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms.max(1))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms.max(1))
    }

    pub fn replay_interval(&self) -> Duration {
        Duration::from_millis(self.replay_interval_ms.max(1))
    }

    pub fn thumbnail_bounds(&self) -> (u32, u32) {
        (self.thumbnail_size, self.thumbnail_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_cover_every_field() {
        let config = config_from(&[]).unwrap();
        assert!(!config.mock);
        assert_eq!(config.yamcs_url.as_deref(), Some("localhost:8090/yamcs"));
        assert_eq!(
            config.processor_path,
            ("viper".to_string(), "realtime".to_string())
        );
        assert_eq!(config.image_parameters.len(), 8);
        assert_eq!(config.light_parameters, vec![LIGHT_STATE_PARAMETER.to_string()]);
        assert_eq!(config.update_interval(), Duration::from_millis(500));
        assert_eq!(config.reconnect_delay(), Duration::from_secs(2));
        assert_eq!(config.thumbnail_bounds(), (240, 240));
        assert_eq!(config.replay_mode, SelectionMode::Sequential);
        assert_eq!(
            config.light_log_path,
            Some(PathBuf::from("logs/lightstate.csv"))
        );
        assert!(config.database_url.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config_from(&[
            ("ROVER_MOCK", "true"),
            ("ROVER_PROCESSOR_PATH", "viper/replay"),
            ("ROVER_IMAGE_PARAMETERS", "/a, /b,,"),
            ("ROVER_REPLAY_MODE", "no_replacement"),
            ("ROVER_REPLAY_SEED", "9"),
            ("ROVER_LIGHT_LOG", ""),
            ("DATABASE_URL", "postgres://localhost/rover"),
        ])
        .unwrap();
        assert!(config.mock);
        assert_eq!(config.processor_path.1, "replay");
        assert_eq!(config.image_parameters, vec!["/a".to_string(), "/b".to_string()]);
        assert_eq!(config.replay_mode, SelectionMode::NoReplacement);
        assert_eq!(config.replay_seed, Some(9));
        assert!(config.light_log_path.is_none());
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/rover")
        );
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(config_from(&[("ROVER_PROCESSOR_PATH", "viper")]).is_err());
        assert!(config_from(&[("ROVER_REPLAY_MODE", "shuffle")]).is_err());
        assert!(config_from(&[("ROVER_MOCK", "maybe")]).is_err());
        assert!(config_from(&[("ROVER_UPDATE_INTERVAL_MS", "soon")]).is_err());
    }
}
