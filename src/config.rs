//! Server configuration and hook-file discovery.

use std::collections::HashSet;
use std::fs;
use std::io::{self, Read};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use ipnet::IpNet;
use serde::Deserialize;
use tracing::{error, info};
use walkdir::WalkDir;

use crate::error::{Result, RunnerError};
use crate::hook::{DEFAULT_COMMAND_TIMEOUT_SECS, Hook, HookConfig};
use crate::template::EnvLookup;

pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:80";
/// Path that means "read from stdin".
pub const STDIN_PATH: &str = "-";
/// Hook secret that opts out of the server-wide secret.
pub const NO_SECRET: &str = "none";

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RunnerConfig {
    pub listen_address: String,
    pub log_dir: Option<PathBuf>,
    /// Default seconds a command may run.
    pub command_timeout: u64,
    /// Peers allowed to connect, as addresses or CIDR networks. Empty allows all.
    pub accept_ips: Vec<String>,
    /// Secret required by hooks that do not set their own.
    pub secret: String,
    /// Files or directories holding `[[hook]]` tables.
    pub hook_paths: Vec<PathBuf>,
    #[serde(rename = "hook")]
    pub hooks: Vec<HookConfig>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            log_dir: None,
            command_timeout: DEFAULT_COMMAND_TIMEOUT_SECS,
            accept_ips: Vec::new(),
            secret: String::new(),
            hook_paths: Vec::new(),
            hooks: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct HookFile {
    #[serde(default, rename = "hook")]
    hooks: Vec<HookConfig>,
}

/// Load and parse the main configuration file
pub fn load_config(path: &str) -> Result<RunnerConfig> {
    let text = read_source(Path::new(path))?;
    toml::from_str(&text).map_err(|e| {
        RunnerError::Config(format!("Failed to parse config file '{}': {}", path, e))
    })
}

fn read_source(path: &Path) -> Result<String> {
    if path == Path::new(STDIN_PATH) {
        let mut text = String::new();
        io::stdin().read_to_string(&mut text)?;
        return Ok(text);
    }
    fs::read_to_string(path).map_err(|e| {
        RunnerError::Config(format!("Failed to read '{}': {}", path.display(), e))
    })
}

/// Parse one hook file.
pub fn load_hook_file(path: &Path) -> Result<Vec<HookConfig>> {
    let name = if path == Path::new(STDIN_PATH) {
        "stdin".to_string()
    } else {
        path.display().to_string()
    };
    info!("Reading hooks from {}", name);

    let text = read_source(path)?;
    let file: HookFile = toml::from_str(&text)
        .map_err(|e| RunnerError::Config(format!("Error loading {}: {}", name, e)))?;
    Ok(file.hooks)
}

/// Expand a hook path into the files it names. Directories are walked
/// recursively in file-name order; symlinks are followed and loops are errors.
pub fn collect_hook_files(path: &Path) -> Result<Vec<PathBuf>> {
    if path == Path::new(STDIN_PATH) {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(path).follow_links(true).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            RunnerError::Config(format!("Error loading {}: {}", path.display(), e))
        })?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

impl RunnerConfig {
    pub fn add_hook_path(&mut self, path: &Path) -> Result<()> {
        for file in collect_hook_files(path)? {
            let hooks = load_hook_file(&file)?;
            self.hooks.extend(hooks);
        }
        Ok(())
    }

    /// Load every configured `hook_paths` entry.
    pub fn load_hook_paths(&mut self) -> Result<()> {
        for path in self.hook_paths.clone() {
            self.add_hook_path(&path)?;
        }
        Ok(())
    }

    /// Fill in the server-wide timeout and secret.
    pub fn apply_defaults(&self, hook: &mut HookConfig) {
        if hook.timeout == 0 {
            hook.timeout = self.command_timeout;
        }
        if hook.secret == NO_SECRET {
            hook.secret.clear();
        } else if hook.secret.is_empty() {
            hook.secret = self.secret.clone();
        }
    }

    /// Compile every hook. All failures are logged before the first one is
    /// returned, so the operator sees every broken hook at once.
    pub fn build_hooks(&self, env: &dyn EnvLookup) -> Result<Vec<Hook>> {
        let mut hooks = Vec::with_capacity(self.hooks.len());
        let mut seen = HashSet::new();
        let mut routes = matchit::Router::new();
        let mut failed = 0usize;

        for config in &self.hooks {
            info!("Loading hook {}", config.url);

            if !config.url.starts_with('/') {
                error!("Hook url {:?} must start with '/'", config.url);
                failed += 1;
                continue;
            }
            if config
                .url
                .split('/')
                .any(|segment| segment.starts_with(':') || segment.starts_with('*'))
            {
                error!(
                    "Hook url {} must use {{name}} for path parameters",
                    config.url
                );
                failed += 1;
                continue;
            }
            if !seen.insert(config.url.clone()) {
                error!("Hook url {} is defined more than once", config.url);
                failed += 1;
                continue;
            }
            if let Err(e) = routes.insert(config.url.as_str(), ()) {
                error!("Hook url {} is not a valid route: {}", config.url, e);
                failed += 1;
                continue;
            }

            let mut config = config.clone();
            self.apply_defaults(&mut config);
            match Hook::new(config, env) {
                Ok(hook) => hooks.push(hook),
                Err(e) => {
                    error!("{}", e);
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            return Err(RunnerError::Config(format!(
                "{} of {} hooks failed to load",
                failed,
                self.hooks.len()
            )));
        }
        Ok(hooks)
    }

    /// Parse `accept_ips`. A bare address is treated as a single-host network.
    pub fn accept_networks(&self) -> Result<Vec<IpNet>> {
        self.accept_ips
            .iter()
            .map(|entry| {
                entry
                    .parse::<IpNet>()
                    .or_else(|_| entry.parse::<IpAddr>().map(IpNet::from))
                    .map_err(|_| {
                        RunnerError::Config(format!("Invalid accept_ips entry '{}'", entry))
                    })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const MAIN: &str = r#"
listen_address = "127.0.0.1:9000"
command_timeout = 10
secret = "server-secret"
accept_ips = ["10.0.0.0/8", "192.168.1.7"]

[[hook]]
url = "/deploy"
allow_branches = ["main"]
commands = [["git", "pull"], ["make", "{{ref}}"]]

[[hook]]
url = "/open"
secret = "none"
timeout = 2
per_commit = true
commands = [["echo", "{{commit.id}}"]]
"#;

    fn parse(text: &str) -> RunnerConfig {
        toml::from_str(text).unwrap()
    }

    #[test]
    fn parses_main_config() {
        let config = parse(MAIN);
        assert_eq!(config.listen_address, "127.0.0.1:9000");
        assert_eq!(config.command_timeout, 10);
        assert_eq!(config.hooks.len(), 2);
        assert_eq!(config.hooks[0].allow_branches, vec!["main"]);
        assert_eq!(config.hooks[0].commands[1], vec!["make", "{{ref}}"]);
        assert!(config.hooks[1].per_commit);
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = parse("");
        assert_eq!(config, RunnerConfig::default());
        assert_eq!(config.listen_address, DEFAULT_LISTEN_ADDRESS);
        assert_eq!(config.command_timeout, DEFAULT_COMMAND_TIMEOUT_SECS);
    }

    #[test]
    fn defaults_fill_timeout_and_secret() {
        let config = parse(MAIN);

        let mut inherits = config.hooks[0].clone();
        config.apply_defaults(&mut inherits);
        assert_eq!(inherits.timeout, 10);
        assert_eq!(inherits.secret, "server-secret");

        let mut opted_out = config.hooks[1].clone();
        config.apply_defaults(&mut opted_out);
        assert_eq!(opted_out.timeout, 2);
        assert_eq!(opted_out.secret, "");
    }

    #[test]
    fn builds_hooks() {
        let hooks = parse(MAIN).build_hooks(&HashMap::new()).unwrap();
        assert_eq!(hooks.len(), 2);
        assert_eq!(hooks[0].secret(), Some("server-secret"));
        assert_eq!(hooks[1].secret(), None);
        assert_eq!(hooks[1].timeout_secs(), 2);
    }

    #[test]
    fn any_bad_hook_fails_the_load() {
        let mut config = parse(MAIN);
        config.hooks[1].commands[0][1] = "{{#if ref}}{{/each}}".to_string();
        let err = config.build_hooks(&HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("1 of 2"));
    }

    #[test]
    fn duplicate_and_relative_urls_are_rejected() {
        let mut config = parse(MAIN);
        config.hooks[1].url = "/deploy".to_string();
        assert!(config.build_hooks(&HashMap::new()).is_err());

        let mut config = parse(MAIN);
        config.hooks[0].url = "deploy".to_string();
        assert!(config.build_hooks(&HashMap::new()).is_err());
    }

    #[test]
    fn conflicting_and_malformed_routes_are_rejected() {
        let mut config = parse(MAIN);
        config.hooks[0].url = "/repo/{a}".to_string();
        config.hooks[1].url = "/repo/{b}".to_string();
        let err = config.build_hooks(&HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("1 of 2"));

        let mut config = parse(MAIN);
        config.hooks[1].url = "/repo/{name".to_string();
        let err = config.build_hooks(&HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("1 of 2"));
    }

    #[test]
    fn accept_ips_allow_addresses_and_networks() {
        let nets = parse(MAIN).accept_networks().unwrap();
        assert_eq!(nets.len(), 2);
        assert!(nets[0].contains(&"10.1.2.3".parse::<IpAddr>().unwrap()));
        assert!(nets[1].contains(&"192.168.1.7".parse::<IpAddr>().unwrap()));
        assert!(!nets[1].contains(&"192.168.1.8".parse::<IpAddr>().unwrap()));

        let config = RunnerConfig {
            accept_ips: vec!["not-an-ip".to_string()],
            ..RunnerConfig::default()
        };
        assert!(config.accept_networks().is_err());
    }

    #[test]
    fn hook_directories_are_walked_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested");
        fs::create_dir(&nested).unwrap();
        fs::write(
            dir.path().join("b.toml"),
            "[[hook]]\nurl = \"/b\"\ncommands = [[\"true\"]]\n",
        )
        .unwrap();
        fs::write(
            nested.join("a.toml"),
            "[[hook]]\nurl = \"/nested\"\ncommands = [[\"true\"]]\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("a.toml"),
            "[[hook]]\nurl = \"/a1\"\n\n[[hook]]\nurl = \"/a2\"\n",
        )
        .unwrap();

        let mut config = RunnerConfig {
            hook_paths: vec![dir.path().to_path_buf()],
            ..RunnerConfig::default()
        };
        config.load_hook_paths().unwrap();

        let urls: Vec<_> = config.hooks.iter().map(|h| h.url.as_str()).collect();
        assert_eq!(urls, vec!["/a1", "/a2", "/b", "/nested"]);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_loop_in_hook_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("a.toml"),
            "[[hook]]\nurl = \"/a\"\ncommands = [[\"true\"]]\n",
        )
        .unwrap();
        std::os::unix::fs::symlink(dir.path(), dir.path().join("loop")).unwrap();

        let err = collect_hook_files(dir.path()).unwrap_err();
        assert!(matches!(err, RunnerError::Config(_)));
        assert!(!err.to_string().contains("loop/loop"));
    }

    #[test]
    fn single_file_path_is_returned_as_is() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hooks.toml");
        fs::write(&path, "").unwrap();
        assert_eq!(collect_hook_files(&path).unwrap(), vec![path]);
    }

    #[test]
    fn unparsable_hook_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[[hook]\nurl = ").unwrap();

        let mut config = RunnerConfig::default();
        assert!(config.add_hook_path(&path).is_err());
        assert!(config.add_hook_path(&dir.path().join("missing.toml")).is_err());
    }
}
