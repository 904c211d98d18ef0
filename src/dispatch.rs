//! Filter -> render -> run pipeline for one event against one hook.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info_span};
use uuid::Uuid;

use crate::error::Result;
use crate::event::{Event, EventView, kind_of};
use crate::executor::{resolve_all, run_command};
use crate::filter::{self, Rejection};
use crate::hook::Hook;
use crate::render::render_unit;

/// What happened to one event.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// A filter rejected the event; nothing was rendered or run.
    Rejected(Rejection),
    /// One result per unit of work, in order.
    Ran(Vec<Result<()>>),
}

impl DispatchOutcome {
    pub fn units(&self) -> usize {
        match self {
            DispatchOutcome::Rejected(_) => 0,
            DispatchOutcome::Ran(results) => results.len(),
        }
    }

    pub fn failures(&self) -> usize {
        match self {
            DispatchOutcome::Rejected(_) => 0,
            DispatchOutcome::Ran(results) => results.iter().filter(|r| r.is_err()).count(),
        }
    }
}

/// Run `hook` for `event`.
///
/// Per-commit hooks run one unit per commit record and keep going after a
/// failed unit. Failures are logged here and never propagated.
pub async fn execute(hook: &Hook, event: &Event) -> DispatchOutcome {
    if let Err(rejection) = filter::check(hook.config(), event) {
        rejection.log(hook.url());
        return DispatchOutcome::Rejected(rejection);
    }

    let mut results = Vec::new();

    if hook.per_commit() {
        for record in event.commits().unwrap_or_default() {
            let Value::Object(commit) = record else {
                error!(hook = %hook.url(), "Commit had type {}", kind_of(record));
                continue;
            };
            let view = event.with_commit(commit);
            let result = run_unit(hook, &view).await;
            report(hook, &view, &result);
            results.push(result);
        }
    } else {
        let view = event.view();
        let result = run_unit(hook, &view).await;
        report(hook, &view, &result);
        results.push(result);
    }

    DispatchOutcome::Ran(results)
}

/// Render, resolve every program, then run the commands in sequence.
async fn run_unit(hook: &Hook, view: &EventView<'_>) -> Result<()> {
    let unit = render_unit(hook.templates(), view)?;
    let commands = resolve_all(unit.commands)?;
    let timeout = Duration::from_secs(hook.timeout_secs());

    for cmd in &commands {
        run_command(cmd, &unit.env, &unit.dir, timeout).await?;
    }
    Ok(())
}

fn report(hook: &Hook, view: &EventView<'_>, result: &Result<()>) {
    if let Err(e) = result {
        error!(hook = %hook.url(), "Error processing {}: {}", hook.url(), e);
        debug!(hook = %hook.url(), event = %view.to_value(), "Failed event payload");
    }
}

/// Spawns dispatches in the background and tracks them for shutdown.
#[derive(Clone, Default)]
pub struct Dispatcher {
    tracker: TaskTracker,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire and forget: the caller never sees the outcome.
    pub fn spawn(&self, hook: Arc<Hook>, event: Event) {
        let span = info_span!("dispatch", hook = %hook.url(), dispatch_id = %Uuid::now_v7());
        self.tracker.spawn(
            async move {
                execute(&hook, &event).await;
            }
            .instrument(span),
        );
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting work and wait up to `grace` for running dispatches.
    /// Returns `false` if some were still running.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.tracker.close();
        tokio::time::timeout(grace, self.tracker.wait()).await.is_ok()
    }
}
