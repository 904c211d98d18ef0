//! Hook definitions and their compiled templates.

use std::fmt;

use serde::Deserialize;

use crate::error::{Result, RunnerError};
use crate::template::{EnvLookup, TemplateId, TemplateSet};

/// Timeout used when neither the hook nor the server configures one.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 5;

/// One `[[hook]]` table as authored in a hook file.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct HookConfig {
    /// Route at which the hook is served.
    pub url: String,
    /// Working directory template. Blank means the server's working directory.
    pub dir: String,
    /// `KEY=VALUE` templates. Empty means the child inherits the server environment.
    pub env: Vec<String>,
    /// Run the commands once per commit in the event instead of once per event.
    pub per_commit: bool,
    pub allow_event: Vec<String>,
    pub allow_pipeline_status: Vec<String>,
    pub allow_branches: Vec<String>,
    /// Each command is a list of argument templates, program first.
    pub commands: Vec<Vec<String>>,
    /// Seconds each command may run. Zero means the server default.
    pub timeout: u64,
    /// Secret a request must present. Empty means none required.
    pub secret: String,
}

impl HookConfig {
    /// Compile every template source of this hook.
    ///
    /// Either every template compiles and the returned set mirrors the
    /// source lists one-to-one, or nothing is returned.
    pub fn create_templates(&self, env: &dyn EnvLookup) -> Result<CompiledTemplates> {
        let mut set = TemplateSet::new();

        let mut commands = Vec::with_capacity(self.commands.len());
        for (i, args) in self.commands.iter().enumerate() {
            if args.is_empty() {
                return Err(RunnerError::Compile {
                    template: format!("commands[{i}]"),
                    message: "command has no program".to_string(),
                });
            }
            let compiled = args
                .iter()
                .enumerate()
                .map(|(j, arg)| set.compile(&format!("commands[{i}][{j}]"), arg, env))
                .collect::<Result<Vec<_>>>()?;
            commands.push(compiled);
        }

        let env_templates = self
            .env
            .iter()
            .enumerate()
            .map(|(i, entry)| set.compile(&format!("env[{i}]"), entry, env))
            .collect::<Result<Vec<_>>>()?;

        let dir = if self.dir.is_empty() {
            None
        } else {
            Some(set.compile("dir", &self.dir, env)?)
        };

        Ok(CompiledTemplates {
            set,
            dir,
            env: env_templates,
            commands,
        })
    }
}

/// Templates compiled once at load time and shared read-only afterwards.
pub struct CompiledTemplates {
    pub(crate) set: TemplateSet,
    pub(crate) dir: Option<TemplateId>,
    pub(crate) env: Vec<TemplateId>,
    pub(crate) commands: Vec<Vec<TemplateId>>,
}

impl CompiledTemplates {
    pub fn command_count(&self) -> usize {
        self.commands.len()
    }

    pub fn env_count(&self) -> usize {
        self.env.len()
    }

    pub fn has_dir(&self) -> bool {
        self.dir.is_some()
    }
}

/// A hook that is ready to serve events.
pub struct Hook {
    config: HookConfig,
    templates: CompiledTemplates,
}

impl Hook {
    /// Compile `config`. A hook that fails here must not be registered.
    pub fn new(config: HookConfig, env: &dyn EnvLookup) -> Result<Self> {
        let templates = config.create_templates(env).map_err(|e| match e {
            RunnerError::Compile { template, message } => RunnerError::Compile {
                template: format!("{} {}", config.url, template),
                message,
            },
            other => other,
        })?;
        Ok(Self { config, templates })
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    pub fn config(&self) -> &HookConfig {
        &self.config
    }

    pub fn templates(&self) -> &CompiledTemplates {
        &self.templates
    }

    pub fn per_commit(&self) -> bool {
        self.config.per_commit
    }

    pub fn secret(&self) -> Option<&str> {
        Some(self.config.secret.as_str()).filter(|s| !s.is_empty())
    }

    pub fn timeout_secs(&self) -> u64 {
        match self.config.timeout {
            0 => DEFAULT_COMMAND_TIMEOUT_SECS,
            secs => secs,
        }
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("url", &self.config.url)
            .field("commands", &self.templates.command_count())
            .finish_non_exhaustive()
    }
}
