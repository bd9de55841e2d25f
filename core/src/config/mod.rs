pub mod settings;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::protocol::amqp::frame::FRAME_MIN_SIZE;
use crate::storage::StoreSettings;
use crate::virtualhost::VirtualHostConfig;

/// Which [`MessageStore`](crate::storage::MessageStore) backs each virtual host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    #[default]
    Memory,
    Journal,
}

impl fmt::Display for StoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Memory => "memory",
            Self::Journal => "journal",
        })
    }
}

impl FromStr for StoreType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "journal" => Ok(Self::Journal),
            other => Err(format!("unknown store type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,

    // Tuning proposed in connection.tune; 0 means no limit
    pub channel_max: u16,
    pub frame_max: u32,
    /// Seconds.
    pub heartbeat: u16,

    // Storage
    pub data_dir: String,
    pub store_type: StoreType,
    pub fsync_on_commit: bool,

    pub virtual_hosts: Vec<String>,
    /// Applied to queues declared without `x-qpid-maximum-delivery-count`.
    pub default_max_delivery_count: u32,

    // ACL configuration
    pub enable_acl: bool,
    pub acl_config_file: Option<String>,
    pub allow_everyone: bool,
    pub super_users: Vec<String>,

    // Authentication
    pub users: HashMap<String, String>,
    pub allow_anonymous: bool,

    /// Seconds between metrics reports; 0 disables them.
    pub metrics_interval_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5672,
            max_connections: 1000,
            channel_max: 2047,
            frame_max: 131_072,
            heartbeat: 60,
            data_dir: "./data".to_string(),
            store_type: StoreType::Memory,
            fsync_on_commit: true,
            virtual_hosts: vec!["default".to_string()],
            default_max_delivery_count: 0,
            enable_acl: false,
            acl_config_file: None,
            allow_everyone: true,
            super_users: vec!["admin".to_string()],
            users: HashMap::new(),
            allow_anonymous: true,
            metrics_interval_secs: 60,
        }
    }
}

impl BrokerConfig {
    pub fn with_listener(mut self, host: &str, port: u16) -> Self {
        self.host = host.to_string();
        self.port = port;
        self
    }

    pub fn with_tuning(mut self, channel_max: u16, frame_max: u32, heartbeat: u16) -> Self {
        self.channel_max = channel_max;
        self.frame_max = frame_max;
        self.heartbeat = heartbeat;
        self
    }

    /// Journal-backed virtual hosts under `data_dir`.
    pub fn with_journal(mut self, data_dir: &str) -> Self {
        self.store_type = StoreType::Journal;
        self.data_dir = data_dir.to_string();
        self
    }

    pub fn with_virtual_host(mut self, name: &str) -> Self {
        let name = name.trim_start_matches('/').to_string();
        if !self.virtual_hosts.contains(&name) {
            self.virtual_hosts.push(name);
        }
        self
    }

    pub fn with_acl(mut self, acl_config_file: Option<&str>, allow_everyone: bool) -> Self {
        self.enable_acl = true;
        self.acl_config_file = acl_config_file.map(|s| s.to_string());
        self.allow_everyone = allow_everyone;
        self
    }

    pub fn with_user(mut self, name: &str, password: &str) -> Self {
        self.users.insert(name.to_string(), password.to_string());
        self
    }

    pub fn add_super_user(mut self, username: &str) -> Self {
        if !self.super_users.iter().any(|u| u == username) {
            self.super_users.push(username.to_string());
        }
        self
    }

    /// ACLs required, no anonymous access.
    pub fn secure_mode(mut self) -> Self {
        self.enable_acl = true;
        self.allow_everyone = false;
        self.allow_anonymous = false;
        self
    }

    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            path: match self.store_type {
                StoreType::Memory => None,
                StoreType::Journal => Some(PathBuf::from(&self.data_dir)),
            },
            fsync_on_commit: self.fsync_on_commit,
        }
    }

    pub fn virtual_host_configs(&self) -> Vec<VirtualHostConfig> {
        self.virtual_hosts
            .iter()
            .map(|name| {
                VirtualHostConfig::new(name)
                    .with_store(self.store_type, self.store_settings())
                    .with_default_max_delivery_count(self.default_max_delivery_count)
            })
            .collect()
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_connections == 0 {
            return Err("max_connections must be > 0".to_string());
        }
        if self.frame_max != 0 && self.frame_max < FRAME_MIN_SIZE {
            return Err(format!(
                "frame_max must be 0 or at least {}",
                FRAME_MIN_SIZE
            ));
        }
        if self.virtual_hosts.is_empty() {
            return Err("at least one virtual host is required".to_string());
        }
        if self.store_type == StoreType::Journal && self.data_dir.trim().is_empty() {
            return Err("journal store requires data_dir".to_string());
        }
        for vhost in self.virtual_host_configs() {
            vhost.validate()?;
        }
        Ok(())
    }
}
