//! Configuration management for the backup engine.
//!
//! Loads `backup.toml` from the config directory. Every host setting can be
//! given per host, under `[defaults]`, or fall back to a built-in default.
//! String settings may reference other settings of the same host with
//! `${field}` placeholders, e.g. `host_storage_dir = "${storage_dir}/${host}"`.

use crate::retention::{parse_keep_strategy, KeepStrategy};
use crate::utils::errors::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Config file name inside the config directory
pub const CONFIG_FILE_NAME: &str = "backup.toml";

/// SSH private key file name inside the config directory
pub const SSH_PRIVATE_KEY_FILE: &str = "backup_ssh_private_key";

/// SSH known hosts file name inside the config directory
pub const SSH_KNOWN_HOSTS_FILE: &str = "backup_ssh_known_hosts";

/// Resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub conf_dir: PathBuf,
    pub log: LogConfig,
    pub ssh: SshConfig,
    hosts: Vec<HostConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Private key passed to ssh with `-i`
    pub private_key: PathBuf,

    /// Known hosts file used instead of the user's
    pub known_hosts: PathBuf,
}

/// One volume (top-level remote directory) to transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeConfig {
    pub volume: String,

    #[serde(default)]
    pub exclude: Vec<String>,
}

/// Monitoring receiver of a host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyConfig {
    /// `server` or `server:port`
    pub server: String,

    /// Host name the items are reported under
    pub host: String,

    /// Delivery attempts before giving up
    pub attempts: u32,
}

/// Fully resolved settings of one host job
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub host: String,
    pub remote_address: String,
    pub host_storage_dir: PathBuf,
    pub cmd_nice: String,
    pub cmd_rsync: String,
    pub cmd_ssh: String,
    pub keep_strategy: Option<Arc<dyn KeepStrategy>>,
    pub schedule_group: String,
    pub schedule_enabled: bool,
    pub remote_ssh_port: Option<u16>,
    pub volumes: Vec<VolumeConfig>,
    pub notify: Option<NotifyConfig>,
}

/// Host settings as written in the file; unset fields inherit
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostSettings {
    pub host: Option<String>,
    pub remote_address: Option<String>,
    pub storage_dir: Option<String>,
    pub host_storage_dir: Option<String>,
    pub cmd_nice: Option<String>,
    pub cmd_rsync: Option<String>,
    pub cmd_ssh: Option<String>,
    pub keep_strategy: Option<String>,
    pub schedule_group: Option<String>,
    pub schedule_enabled: Option<bool>,
    pub remote_ssh_port: Option<u16>,
    pub volumes: Option<Vec<VolumeConfig>>,
    pub notify_zabbix_server: Option<String>,
    pub notify_zabbix_host: Option<String>,
    pub notify_attempts: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    log: LogConfig,

    #[serde(default)]
    defaults: HostSettings,

    #[serde(default)]
    hosts: Vec<HostSettings>,
}

// Default values
fn default_log_level() -> String {
    "info".to_string()
}

fn default_notify_attempts() -> u32 {
    1
}

/// Placeholder-resolvable string settings, in resolution order
const STRING_FIELDS: &[&str] = &[
    "host",
    "remote_address",
    "storage_dir",
    "host_storage_dir",
    "cmd_nice",
    "cmd_rsync",
    "cmd_ssh",
    "keep_strategy",
    "schedule_group",
    "notify_zabbix_server",
    "notify_zabbix_host",
];

impl HostSettings {
    /// Built-in defaults applied below `[defaults]`
    pub fn builtin() -> Self {
        Self {
            host: None,
            remote_address: Some("${host}".to_string()),
            storage_dir: Some("hosts".to_string()),
            host_storage_dir: Some("${storage_dir}/${host}".to_string()),
            cmd_nice: Some("/usr/bin/nice -n 19 /usr/bin/ionice -c3".to_string()),
            cmd_rsync: Some("/usr/bin/rsync".to_string()),
            cmd_ssh: Some("/usr/bin/ssh".to_string()),
            keep_strategy: None,
            schedule_group: Some("${host}".to_string()),
            schedule_enabled: Some(true),
            remote_ssh_port: None,
            volumes: Some(vec![VolumeConfig {
                volume: "ROOT".to_string(),
                exclude: vec!["tmp".to_string()],
            }]),
            notify_zabbix_server: None,
            notify_zabbix_host: Some("${host}".to_string()),
            notify_attempts: Some(default_notify_attempts()),
        }
    }

    /// Fill every unset field from `defaults`
    pub fn apply_defaults(&mut self, defaults: &HostSettings) {
        fn fill<T: Clone>(slot: &mut Option<T>, fallback: &Option<T>) {
            if slot.is_none() {
                *slot = fallback.clone();
            }
        }

        fill(&mut self.remote_address, &defaults.remote_address);
        fill(&mut self.storage_dir, &defaults.storage_dir);
        fill(&mut self.host_storage_dir, &defaults.host_storage_dir);
        fill(&mut self.cmd_nice, &defaults.cmd_nice);
        fill(&mut self.cmd_rsync, &defaults.cmd_rsync);
        fill(&mut self.cmd_ssh, &defaults.cmd_ssh);
        fill(&mut self.keep_strategy, &defaults.keep_strategy);
        fill(&mut self.schedule_group, &defaults.schedule_group);
        fill(&mut self.schedule_enabled, &defaults.schedule_enabled);
        fill(&mut self.remote_ssh_port, &defaults.remote_ssh_port);
        fill(&mut self.volumes, &defaults.volumes);
        fill(&mut self.notify_zabbix_server, &defaults.notify_zabbix_server);
        fill(&mut self.notify_zabbix_host, &defaults.notify_zabbix_host);
        fill(&mut self.notify_attempts, &defaults.notify_attempts);
    }

    /// Current value of a field as text, for placeholder substitution
    fn lookup(&self, name: &str) -> Option<String> {
        match name {
            "remote_ssh_port" => self.remote_ssh_port.map(|p| p.to_string()),
            "schedule_enabled" => self.schedule_enabled.map(|e| e.to_string()),
            "notify_attempts" => self.notify_attempts.map(|a| a.to_string()),
            _ => self.string_field(name).cloned().flatten(),
        }
    }

    fn string_field(&self, name: &str) -> Option<&Option<String>> {
        match name {
            "host" => Some(&self.host),
            "remote_address" => Some(&self.remote_address),
            "storage_dir" => Some(&self.storage_dir),
            "host_storage_dir" => Some(&self.host_storage_dir),
            "cmd_nice" => Some(&self.cmd_nice),
            "cmd_rsync" => Some(&self.cmd_rsync),
            "cmd_ssh" => Some(&self.cmd_ssh),
            "keep_strategy" => Some(&self.keep_strategy),
            "schedule_group" => Some(&self.schedule_group),
            "notify_zabbix_server" => Some(&self.notify_zabbix_server),
            "notify_zabbix_host" => Some(&self.notify_zabbix_host),
            _ => None,
        }
    }

    fn string_field_mut(&mut self, name: &str) -> Option<&mut Option<String>> {
        match name {
            "host" => Some(&mut self.host),
            "remote_address" => Some(&mut self.remote_address),
            "storage_dir" => Some(&mut self.storage_dir),
            "host_storage_dir" => Some(&mut self.host_storage_dir),
            "cmd_nice" => Some(&mut self.cmd_nice),
            "cmd_rsync" => Some(&mut self.cmd_rsync),
            "cmd_ssh" => Some(&mut self.cmd_ssh),
            "keep_strategy" => Some(&mut self.keep_strategy),
            "schedule_group" => Some(&mut self.schedule_group),
            "notify_zabbix_server" => Some(&mut self.notify_zabbix_server),
            "notify_zabbix_host" => Some(&mut self.notify_zabbix_host),
            _ => None,
        }
    }

    /// Substitute `${field}` placeholders in every string field, in field order
    pub fn resolve_placeholders(&mut self) -> Result<()> {
        for name in STRING_FIELDS {
            let Some(Some(value)) = self.string_field(name).cloned() else {
                continue;
            };
            let resolved = resolve_placeholders(&value, |field| self.lookup(field))?;
            if let Some(slot) = self.string_field_mut(name) {
                *slot = Some(resolved);
            }
        }
        Ok(())
    }
}

/// Replace each `${name}` in `value` with `lookup(name)`.
///
/// Substituted text is not scanned again.
pub fn resolve_placeholders<F>(value: &str, lookup: F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut resolved = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        resolved.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| BackupError::Config(format!("Invalid placeholder in {}", value)))?;

        let name = &after[..end];
        let replacement = lookup(name).ok_or_else(|| {
            BackupError::Config(format!("Unresolved placeholder '{}' in {}", name, value))
        })?;
        resolved.push_str(&replacement);

        rest = &after[end + 1..];
    }
    resolved.push_str(rest);

    Ok(resolved)
}

impl HostConfig {
    /// Resolve one `[[hosts]]` entry against `[defaults]` and the built-ins
    pub fn resolve(mut settings: HostSettings, defaults: &HostSettings) -> Result<Self> {
        let mut defaults = defaults.clone();
        defaults.apply_defaults(&HostSettings::builtin());
        settings.apply_defaults(&defaults);
        settings.resolve_placeholders()?;

        let host = settings
            .host
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| BackupError::Config("Host entry without 'host' name".to_string()))?;

        let required = |value: Option<String>, field: &str| {
            value.ok_or_else(|| {
                BackupError::Config(format!("Missing '{}' for host {}", field, host))
            })
        };

        let keep_strategy = settings
            .keep_strategy
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(parse_keep_strategy)
            .transpose()?;

        let notify = match (settings.notify_zabbix_server, settings.notify_zabbix_host) {
            (Some(server), Some(notify_host)) if !server.is_empty() && !notify_host.is_empty() => {
                Some(NotifyConfig {
                    server,
                    host: notify_host,
                    attempts: settings.notify_attempts.unwrap_or_else(default_notify_attempts),
                })
            }
            _ => None,
        };

        Ok(Self {
            remote_address: required(settings.remote_address, "remote_address")?,
            host_storage_dir: required(settings.host_storage_dir, "host_storage_dir")?.into(),
            cmd_nice: settings.cmd_nice.unwrap_or_default(),
            cmd_rsync: required(settings.cmd_rsync, "cmd_rsync")?,
            cmd_ssh: required(settings.cmd_ssh, "cmd_ssh")?,
            keep_strategy,
            schedule_group: required(settings.schedule_group, "schedule_group")?,
            schedule_enabled: settings.schedule_enabled.unwrap_or(true),
            remote_ssh_port: settings.remote_ssh_port.filter(|p| *p > 0),
            volumes: settings.volumes.unwrap_or_default(),
            notify,
            host,
        })
    }
}

impl Config {
    /// Load `backup.toml` from `conf_dir` and prepare the SSH key
    pub fn load(conf_dir: &Path) -> Result<Self> {
        let conf_dir = if conf_dir.is_absolute() {
            conf_dir.to_path_buf()
        } else {
            std::env::current_dir()?.join(conf_dir)
        };

        let path = conf_dir.join(CONFIG_FILE_NAME);
        let content = std::fs::read_to_string(&path).map_err(|e| {
            BackupError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&content, &conf_dir)?;

        let key = &config.ssh.private_key;
        if !key.is_file() {
            return Err(BackupError::Config(format!(
                "Missing ssh keyfile: {}",
                key.display()
            )));
        }
        restrict_permissions(key)?;

        Ok(config)
    }

    /// Parse configuration text; paths are relative to `conf_dir`
    pub fn from_toml_str(content: &str, conf_dir: &Path) -> Result<Self> {
        let file: ConfigFile = toml::from_str(content)?;

        let mut seen = HashSet::new();
        let mut hosts = Vec::with_capacity(file.hosts.len());
        for settings in file.hosts {
            let host = HostConfig::resolve(settings, &file.defaults)?;
            if !seen.insert(host.host.clone()) {
                return Err(BackupError::Config(format!("Duplicate host entry: {}", host.host)));
            }
            hosts.push(host);
        }

        Ok(Self {
            conf_dir: conf_dir.to_path_buf(),
            log: file.log,
            ssh: SshConfig {
                private_key: conf_dir.join(SSH_PRIVATE_KEY_FILE),
                known_hosts: conf_dir.join(SSH_KNOWN_HOSTS_FILE),
            },
            hosts,
        })
    }

    /// All hosts in file order
    pub fn hosts(&self) -> &[HostConfig] {
        &self.hosts
    }

    /// Settings of one host
    pub fn host(&self, name: &str) -> Result<&HostConfig> {
        self.hosts
            .iter()
            .find(|h| h.host == name)
            .ok_or_else(|| BackupError::Config(format!("No configuration for host {}", name)))
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
