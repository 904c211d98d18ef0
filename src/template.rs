//! Template compilation and rendering for hook commands.
//!
//! Sources are first run through process-environment expansion (`$VAR`,
//! `${VAR}`) and then compiled as Handlebars templates in strict mode, so a
//! reference to a field the event does not carry fails the render instead of
//! producing an empty argument.

use std::collections::HashMap;
use std::env;

use handlebars::{Context, Handlebars, Helper, HelperResult, Output, RenderContext, RenderErrorReason};
use serde::Serialize;

use crate::error::{Result, RunnerError};

/// Helpers a template may call. Anything else in call position is rejected
/// when the template is compiled.
pub const KNOWN_HELPERS: &[&str] = &["json", "if", "unless", "each", "with", "lookup"];

/// Name -> value lookup used for `$VAR` expansion at compile time.
pub trait EnvLookup {
    fn lookup(&self, name: &str) -> Option<String>;
}

/// Reads the host process environment.
pub struct ProcessEnv;

impl EnvLookup for ProcessEnv {
    #[inline]
    fn lookup(&self, name: &str) -> Option<String> {
        env::var(name).ok()
    }
}

impl EnvLookup for HashMap<String, String> {
    fn lookup(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Substitute `$VAR` and `${VAR}` from `env`. Unset variables expand to the
/// empty string.
pub fn expand_env(source: &str, env: &dyn EnvLookup) -> String {
    shellexpand::env_with_context_no_errors(source, |name: &str| {
        Some(env.lookup(name).unwrap_or_default())
    })
    .into_owned()
}

/// Handle to a template compiled into a [`TemplateSet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateId(String);

/// A registry of compiled templates sharing one helper set.
pub struct TemplateSet {
    registry: Handlebars<'static>,
}

impl Default for TemplateSet {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateSet {
    pub fn new() -> Self {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry.register_escape_fn(handlebars::no_escape);
        registry.register_helper("json", Box::new(json_helper));
        Self { registry }
    }

    /// Expand environment references in `source` and compile it under `name`.
    pub fn compile(&mut self, name: &str, source: &str, env: &dyn EnvLookup) -> Result<TemplateId> {
        let expanded = expand_env(source, env);

        self.registry
            .register_template_string(name, &expanded)
            .map_err(|e| RunnerError::Compile {
                template: name.to_string(),
                message: e.to_string(),
            })?;

        if let Err(message) = check_helpers(&expanded) {
            self.registry.unregister_template(name);
            return Err(RunnerError::Compile {
                template: name.to_string(),
                message,
            });
        }

        Ok(TemplateId(name.to_string()))
    }

    pub fn render<T: Serialize>(&self, id: &TemplateId, data: &T) -> Result<String> {
        self.render_in(id, &Self::context(data)?)
    }

    /// Serialize `data` once so several templates can render against it.
    pub fn context<T: Serialize>(data: &T) -> Result<Context> {
        Ok(Context::wraps(data)?)
    }

    pub fn render_in(&self, id: &TemplateId, context: &Context) -> Result<String> {
        Ok(self.registry.render_with_context(&id.0, context)?)
    }

    pub fn len(&self) -> usize {
        self.registry.get_templates().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn json_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let param = h
        .param(0)
        .ok_or(RenderErrorReason::ParamNotFoundForIndex("json", 0))?;
    out.write(&param.value().to_string())?;
    Ok(())
}

/// Reject helpers outside [`KNOWN_HELPERS`].
///
/// Runs on source the Handlebars parser already accepted, so it only has to
/// pick out the names in call position.
fn check_helpers(source: &str) -> std::result::Result<(), String> {
    let mut rest = source;

    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];

        if let Some(comment) = after.strip_prefix("!--") {
            rest = match comment.find("--}}") {
                Some(end) => &comment[end + 4..],
                None => "",
            };
            continue;
        }
        if after.starts_with("{{") {
            return Err("raw blocks are not supported".to_string());
        }
        let Some(end) = after.find("}}") else {
            break;
        };
        let expr = &after[..end];
        rest = &after[end + 2..];

        let expr = expr.trim_start_matches('{').trim_start_matches('~');
        let expr = expr.trim_end_matches('}').trim_end_matches('~').trim();

        if expr.starts_with('!') || expr.starts_with('/') || expr == "else" || expr == "^" {
            continue;
        }
        if expr.starts_with('>') || expr.starts_with("#>") || expr.starts_with('*') || expr.starts_with("#*") {
            return Err(format!("partials and decorators are not supported: {{{{{expr}}}}}"));
        }

        let (block, body) = match expr.strip_prefix('#').or_else(|| expr.strip_prefix('^')) {
            Some(body) => (true, body.trim_start()),
            None => (false, expr.strip_prefix("else ").unwrap_or(expr)),
        };

        let mut words = body.split_whitespace();
        if let Some(head) = words.next() {
            let called = block || words.next().is_some();
            if called && !KNOWN_HELPERS.contains(&head) {
                return Err(format!("function \"{head}\" not defined"));
            }
        }

        for name in subexpression_heads(body) {
            if !KNOWN_HELPERS.contains(&name) {
                return Err(format!("function \"{name}\" not defined"));
            }
        }
    }

    Ok(())
}

/// Names at the head of `( ... )` subexpressions, skipping string literals.
fn subexpression_heads(expr: &str) -> Vec<&str> {
    let mut heads = Vec::new();
    let mut quote = None;

    for (i, c) in expr.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '(') => {
                let tail = expr[i + 1..].trim_start();
                let head = tail
                    .split(|c: char| c.is_whitespace() || c == ')')
                    .next()
                    .unwrap_or_default();
                if !head.is_empty() {
                    heads.push(head);
                }
            }
            _ => {}
        }
    }

    heads
}
