use log::warn;
use ns_lib::{NsError, NsResult, DEFAULT_REQUEST_TIMEOUT};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_NS_GATEWAY_CONFIG_PATH: &str = "/etc/nsgw/ns_gateway.json";
pub const DEFAULT_LIST_LIMIT: u32 = 100;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    #[serde(alias = "listen", alias = "bind")]
    pub listen_addr: String,
    /// Metadata service endpoint, also the write path used by fetch-repair.
    #[serde(alias = "filer", alias = "meta_url")]
    pub filer_url: Option<String>,
    #[serde(alias = "master")]
    pub master_url: String,
    #[serde(alias = "redirect")]
    pub redirect_on_read: bool,
    pub disable_dir_listing: bool,
    #[serde(alias = "origin")]
    pub fallback_origin: Option<String>,
    pub default_list_limit: u32,
    #[serde(alias = "timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(alias = "tmp_dir")]
    pub temp_dir: PathBuf,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8333".to_string(),
            filer_url: None,
            master_url: "http://127.0.0.1:9333".to_string(),
            redirect_on_read: false,
            disable_dir_listing: false,
            fallback_origin: None,
            default_list_limit: DEFAULT_LIST_LIMIT,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT.as_secs(),
            temp_dir: std::env::temp_dir(),
        }
    }
}

impl GatewayConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn list_limit(&self) -> u32 {
        if self.default_list_limit == 0 {
            DEFAULT_LIST_LIMIT
        } else {
            self.default_list_limit
        }
    }
}

fn read_json_config<T: DeserializeOwned>(path: &Path) -> NsResult<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| NsError::IoError(format!("read {} failed: {}", path.display(), e)))?;
    serde_json::from_str::<T>(&content)
        .map_err(|e| NsError::InvalidData(format!("parse {} failed: {}", path.display(), e)))
}

pub fn load_gateway_config(path: &Path) -> NsResult<GatewayConfig> {
    if !path.exists() {
        warn!("config {} not found, using defaults", path.display());
        return Ok(GatewayConfig::default());
    }
    read_json_config(path)
}
