use std::path::{Path, PathBuf};

use tracing::debug;

use crate::models::AgentConfig;
use crate::validation::ConfigError;

/// Where the effective configuration came from. Logged at startup so
/// operators can tell a default-only run from a managed deployment.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    #[default]
    Defaults,
    File(PathBuf),
    Env,
    FileAndEnv(PathBuf),
}

/// Environment prefix: `SHIPLOG__BATCH__MAX_BYTES=2097152` overrides
/// `[batch].max_bytes`.
const ENV_PREFIX: &str = "SHIPLOG";

/// Layer defaults, an optional TOML file, and the environment into an
/// [`AgentConfig`]. Later layers win.
pub fn load(path: Option<&Path>) -> Result<(AgentConfig, ConfigSource), ConfigError> {
    let mut builder = config::Config::builder();

    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path.to_path_buf()).required(true));
    }
    builder = builder.add_source(
        config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("watch.monitoring_paths"),
    );

    let layered = builder.build()?;
    let agent_config: AgentConfig = layered.try_deserialize()?;

    let source = match (path, env_overrides_present()) {
        (Some(p), true) => ConfigSource::FileAndEnv(p.to_path_buf()),
        (Some(p), false) => ConfigSource::File(p.to_path_buf()),
        (None, true) => ConfigSource::Env,
        (None, false) => ConfigSource::Defaults,
    };
    debug!(?source, "configuration loaded");
    Ok((agent_config, source))
}

fn env_overrides_present() -> bool {
    std::env::vars().any(|(key, _)| key.starts_with("SHIPLOG__"))
}
