use super::BrokerConfig;
use crate::{FluxqError, Result};
use config::{Config, ConfigBuilder, Environment, File};

const ENV_PREFIX: &str = "FLUXQ";

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("virtual_hosts")
        .with_list_parse_key("super_users")
}

fn build(builder: ConfigBuilder<config::builder::DefaultState>) -> Result<BrokerConfig> {
    let settings = builder
        .build()
        .map_err(|e| FluxqError::Config(e.to_string()))?;

    let config = settings
        .try_deserialize::<BrokerConfig>()
        .map_err(|e| FluxqError::Config(e.to_string()))?;

    config.validate().map_err(FluxqError::Config)?;
    Ok(config)
}

impl BrokerConfig {
    /// Reads `FLUXQ_*` variables over the defaults, e.g. `FLUXQ_PORT=5673` or
    /// `FLUXQ_VIRTUAL_HOSTS=default,test`.
    pub fn from_env() -> Result<Self> {
        build(Config::builder().add_source(environment()))
    }

    /// Reads a configuration file (TOML, JSON or YAML by extension), then lets
    /// `FLUXQ_*` variables override it.
    pub fn from_file(path: &str) -> Result<Self> {
        build(
            Config::builder()
                .add_source(File::with_name(path))
                .add_source(environment()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreType;
    use std::io::Write;

    #[test]
    fn test_from_file_with_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "port = 5673\nstore_type = \"journal\"\ndata_dir = \"/var/lib/fluxq\"\nvirtual_hosts = [\"default\", \"test\"]"
        )
        .unwrap();

        let path = file.path().to_string_lossy().into_owned();
        let config = BrokerConfig::from_file(&path).unwrap();
        assert_eq!(config.port, 5673);
        assert_eq!(config.store_type, StoreType::Journal);
        assert_eq!(config.virtual_hosts, vec!["default", "test"]);
        assert_eq!(config.channel_max, BrokerConfig::default().channel_max);
    }

    #[test]
    fn test_invalid_file_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "max_connections = 0").unwrap();
        let path = file.path().to_string_lossy().into_owned();
        assert!(matches!(
            BrokerConfig::from_file(&path),
            Err(FluxqError::Config(_))
        ));
    }
}
