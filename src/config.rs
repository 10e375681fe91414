//! Configuration loading (SPEC_FULL.md §6, **[ADDED]**): layered defaults -> optional
//! `config.yaml` -> `CLUSTERNODE_*` environment variables, matching the common layered-config
//! idiom used across the retrieved pack. Every recognized key is a field on `Settings`; anything
//! else is a hard startup error.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShardManagerSettings {
    #[serde(default)]
    pub root_dir: Option<String>,
    #[serde(default = "default_shard_timeout")]
    pub shard_timeout: u64,
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: i32,
}

fn default_shard_timeout() -> u64 {
    300
}

fn default_max_cache_size() -> i32 {
    -1
}

impl Default for ShardManagerSettings {
    fn default() -> Self {
        Self { root_dir: None, shard_timeout: default_shard_timeout(), max_cache_size: default_max_cache_size() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub root_dir: String,
    #[serde(default)]
    pub rpc_host: Option<String>,
    #[serde(default)]
    pub rpc_domain: String,
    #[serde(default = "default_rpc_port")]
    pub rpc_port: u16,
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout: u64,
    #[serde(default = "default_rpc_retries")]
    pub rpc_retries: u32,
    pub servers: Vec<String>,
    #[serde(default)]
    pub backup_frequency: u64,
    #[serde(default = "default_backup_count")]
    pub backup_count: usize,
    #[serde(default = "default_max_shard_size")]
    pub max_shard_size: u64,
    #[serde(default = "default_max_shard_point_count")]
    pub max_shard_point_count: u64,
    #[serde(default = "default_max_search_limit")]
    pub max_search_limit: usize,
    #[serde(default)]
    pub shard_manager: ShardManagerSettings,
}

fn default_rpc_port() -> u16 {
    7070
}
fn default_rpc_timeout() -> u64 {
    5
}
fn default_rpc_retries() -> u32 {
    3
}
fn default_backup_count() -> usize {
    3
}
fn default_max_shard_size() -> u64 {
    256 * 1024 * 1024
}
fn default_max_shard_point_count() -> u64 {
    100_000
}
fn default_max_search_limit() -> usize {
    1_000
}

impl Settings {
    /// The `host:port` string this process is addressed by. Combines `rpcHost` (defaulting to
    /// the OS hostname) with `rpcDomain` when one is configured.
    pub fn self_peer(&self) -> anyhow::Result<String> {
        let host = match &self.rpc_host {
            Some(host) => host.clone(),
            None => hostname::get()?.to_string_lossy().into_owned(),
        };
        let host = if self.rpc_domain.is_empty() { host } else { format!("{host}.{}", self.rpc_domain) };
        Ok(format!("{host}:{}", self.rpc_port))
    }

    pub fn shard_manager_root_dir(&self) -> std::path::PathBuf {
        match &self.shard_manager.root_dir {
            Some(dir) => std::path::PathBuf::from(dir),
            None => std::path::PathBuf::from(&self.root_dir),
        }
    }

    pub fn load(config_file: Option<&std::path::Path>) -> anyhow::Result<Self> {
        let mut builder = ::config::Config::builder()
            .set_default("rpc_port", default_rpc_port() as i64)?
            .set_default("rpc_timeout", default_rpc_timeout() as i64)?
            .set_default("rpc_retries", default_rpc_retries() as i64)?
            .set_default("rpc_domain", "")?
            .set_default("backup_frequency", 0)?
            .set_default("backup_count", default_backup_count() as i64)?
            .set_default("max_shard_size", default_max_shard_size() as i64)?
            .set_default("max_shard_point_count", default_max_shard_point_count() as i64)?
            .set_default("max_search_limit", default_max_search_limit() as i64)?;

        if let Some(path) = config_file {
            builder = builder.add_source(::config::File::from(path).required(false));
        } else {
            builder = builder.add_source(::config::File::with_name("config").required(false));
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix("CLUSTERNODE").separator("__").try_parsing(true),
        );

        let settings: Self = builder.build()?.try_deserialize()?;
        if settings.max_shard_size == 0 {
            anyhow::bail!("max_shard_size must be non-zero");
        }
        if settings.max_shard_point_count == 0 {
            anyhow::bail!("max_shard_point_count must be non-zero");
        }
        Ok(settings)
    }
}
