//! Hook matching predicates.
//!
//! Checks run in a fixed order: event type, pipeline status, branch. The first
//! rejection wins.

use std::fmt;

use serde_json::Value;
use tracing::{info, warn};

use crate::event::{Event, FieldLookup};
use crate::hook::HookConfig;

const BRANCH_PREFIX: &str = "refs/heads/";

/// Which allow-list a rejection came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predicate {
    EventType,
    PipelineStatus,
    Branch,
}

impl Predicate {
    fn key(self) -> &'static str {
        match self {
            Predicate::EventType => "type",
            Predicate::PipelineStatus => "status",
            Predicate::Branch => "ref",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    /// The key was absent or not a string.
    NotAString {
        predicate: Predicate,
        value: Option<Value>,
    },
    /// The value is not on the allow-list.
    NotAllowed { predicate: Predicate, value: String },
}

impl Rejection {
    pub fn predicate(&self) -> Predicate {
        match self {
            Rejection::NotAString { predicate, .. } | Rejection::NotAllowed { predicate, .. } => {
                *predicate
            }
        }
    }

    /// Whether this is worth a warning. Status and branch mismatches are
    /// routine because the sources cannot pre-filter them.
    pub fn is_anomaly(&self) -> bool {
        match self {
            Rejection::NotAString { .. } => true,
            Rejection::NotAllowed { predicate, .. } => *predicate == Predicate::EventType,
        }
    }

    pub fn log(&self, hook_url: &str) {
        if self.is_anomaly() {
            warn!(hook = %hook_url, "{}", self);
        } else {
            info!(hook = %hook_url, "{}", self);
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::NotAString { predicate, value } => match value {
                Some(value) => write!(f, "Received non-string {} {}", predicate.key(), value),
                None => write!(f, "Received event without a {} field", predicate.key()),
            },
            Rejection::NotAllowed { predicate, value } => match predicate {
                Predicate::EventType => write!(f, "Got disallowed event type {value}"),
                Predicate::PipelineStatus => {
                    write!(f, "Called for incorrect pipeline status {value}")
                }
                Predicate::Branch => write!(f, "Called for ignored branch {value}"),
            },
        }
    }
}

/// Decide whether `hook` accepts `event`.
pub fn check(hook: &HookConfig, event: &Event) -> Result<(), Rejection> {
    check_allowed(&hook.allow_event, event, Predicate::EventType)?;
    check_allowed(&hook.allow_pipeline_status, event, Predicate::PipelineStatus)?;
    check_allowed(&hook.allow_branches, event, Predicate::Branch)?;
    Ok(())
}

/// Strip one leading `refs/heads/`, if present.
pub fn branch_name(git_ref: &str) -> &str {
    git_ref.strip_prefix(BRANCH_PREFIX).unwrap_or(git_ref)
}

fn check_allowed(allowed: &[String], event: &Event, predicate: Predicate) -> Result<(), Rejection> {
    if allowed.is_empty() {
        return Ok(());
    }

    let value = match event.str_field(predicate.key()) {
        FieldLookup::Str(value) => value,
        FieldLookup::Missing => {
            return Err(Rejection::NotAString {
                predicate,
                value: None,
            });
        }
        FieldLookup::NotString(value) => {
            return Err(Rejection::NotAString {
                predicate,
                value: Some(value.clone()),
            });
        }
    };

    let value = match predicate {
        Predicate::Branch => branch_name(value),
        _ => value,
    };

    if allowed.iter().any(|a| a == value) {
        Ok(())
    } else {
        Err(Rejection::NotAllowed {
            predicate,
            value: value.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Captured {
        type Writer = Captured;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    /// Lines logged while `f` runs.
    fn logged(f: impl FnOnce()) -> Vec<String> {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(captured.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::TRACE)
            .finish();
        tracing::subscriber::with_default(subscriber, f);

        let bytes = captured.0.lock().unwrap().clone();
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn event(value: Value) -> Event {
        serde_json::from_value(value).unwrap()
    }

    fn hook() -> HookConfig {
        HookConfig {
            url: "/h".to_string(),
            ..HookConfig::default()
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_allow_lists_accept_everything() {
        assert_eq!(check(&hook(), &event(json!({}))), Ok(()));
        assert_eq!(check(&hook(), &event(json!({"type": 1, "ref": null}))), Ok(()));
    }

    #[test]
    fn event_type_must_match_exactly() {
        let h = HookConfig {
            allow_event: strings(&["push"]),
            ..hook()
        };
        assert_eq!(check(&h, &event(json!({"type": "push"}))), Ok(()));

        let err = check(&h, &event(json!({"type": "Push"}))).unwrap_err();
        assert!(matches!(err, Rejection::NotAllowed { predicate: Predicate::EventType, .. }));
        assert!(err.is_anomaly());
    }

    #[test]
    fn missing_or_non_string_type_is_a_warning() {
        let h = HookConfig {
            allow_event: strings(&["push"]),
            ..hook()
        };
        for e in [json!({}), json!({"type": 5}), json!({"type": ["push"]})] {
            let err = check(&h, &event(e)).unwrap_err();
            assert!(matches!(err, Rejection::NotAString { .. }));
            assert!(err.is_anomaly());
        }
    }

    #[test]
    fn disallowed_status_is_informational() {
        let h = HookConfig {
            allow_pipeline_status: strings(&["success"]),
            ..hook()
        };
        assert_eq!(check(&h, &event(json!({"status": "success"}))), Ok(()));

        let err = check(&h, &event(json!({"status": "failed"}))).unwrap_err();
        assert_eq!(err.predicate(), Predicate::PipelineStatus);
        assert!(!err.is_anomaly());

        let err = check(&h, &event(json!({"status": false}))).unwrap_err();
        assert!(err.is_anomaly());
    }

    #[test]
    fn branch_prefix_is_stripped_once() {
        let h = HookConfig {
            allow_branches: strings(&["main", "feature"]),
            ..hook()
        };
        assert_eq!(check(&h, &event(json!({"ref": "refs/heads/main"}))), Ok(()));
        assert_eq!(check(&h, &event(json!({"ref": "main"}))), Ok(()));

        let err = check(&h, &event(json!({"ref": "refs/heads/feature/x"}))).unwrap_err();
        assert_eq!(
            err,
            Rejection::NotAllowed {
                predicate: Predicate::Branch,
                value: "feature/x".to_string()
            }
        );
        assert!(!err.is_anomaly());

        assert!(check(&h, &event(json!({"ref": "refs/heads/refs/heads/main"}))).is_err());
    }

    #[test]
    fn predicates_short_circuit_in_order() {
        let h = HookConfig {
            allow_event: strings(&["push"]),
            allow_pipeline_status: strings(&["success"]),
            allow_branches: strings(&["main"]),
            ..hook()
        };
        let err = check(&h, &event(json!({"type": "tag", "status": 1, "ref": "dev"}))).unwrap_err();
        assert_eq!(err.predicate(), Predicate::EventType);

        let err = check(&h, &event(json!({"type": "push", "status": 1, "ref": "dev"}))).unwrap_err();
        assert_eq!(err.predicate(), Predicate::PipelineStatus);

        let e = json!({"type": "push", "status": "success", "ref": "dev"});
        assert_eq!(check(&h, &event(e)).unwrap_err().predicate(), Predicate::Branch);
    }

    #[test]
    fn rejection_messages_name_the_value() {
        let err = Rejection::NotAllowed {
            predicate: Predicate::Branch,
            value: "dev".to_string(),
        };
        assert_eq!(err.to_string(), "Called for ignored branch dev");
    }

    #[test]
    fn ignored_branch_logs_one_info_line() {
        let h = HookConfig {
            allow_branches: strings(&["main"]),
            ..hook()
        };
        let err = check(&h, &event(json!({"ref": "refs/heads/dev"}))).unwrap_err();

        let lines = logged(|| err.log("/h"));
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("INFO"));
        assert!(lines[0].contains("Called for ignored branch dev"));
    }

    #[test]
    fn disallowed_event_type_logs_a_warning() {
        let h = HookConfig {
            allow_event: strings(&["push"]),
            ..hook()
        };
        let err = check(&h, &event(json!({"type": "tag_push"}))).unwrap_err();

        let lines = logged(|| err.log("/h"));
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("WARN"));
        assert!(lines[0].contains("Got disallowed event type tag_push"));
    }
}
