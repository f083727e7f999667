//! The action tree
//!
//! A recursive tagged variant describing the work a caller wants performed
//! inside a container. The engine compiles this tree into executable steps;
//! it never interprets actions directly.

use serde::{Deserialize, Serialize};

/// Kernel limits a run action may carry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nofile: Option<u64>,
}

/// One environment variable for a spawned process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// Launch a process and wait for it to exit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunAction {
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub resource_limits: ResourceLimits,
    /// Wall-clock bound on the whole run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Run an action while watching a health endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorAction {
    pub action: Box<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthy_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unhealthy_url: Option<String>,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
    pub interval_ms: u64,
}

/// Bracket an action with user-facing progress messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmitProgressAction {
    pub action: Box<Action>,
    #[serde(default)]
    pub start_message: String,
    #[serde(default)]
    pub success_message: String,
    #[serde(default)]
    pub failure_message_prefix: String,
}

/// Fetch an artifact and place it inside the container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadAction {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_name: Option<String>,
}

/// Ship a path out of the container to a URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadAction {
    pub from: String,
    pub to: String,
    pub user: String,
}

/// A user-supplied work unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Run(RunAction),
    Monitor(MonitorAction),
    Try { action: Box<Action> },
    Parallel { actions: Vec<Action> },
    Serial { actions: Vec<Action> },
    EmitProgress(EmitProgressAction),
    Download(DownloadAction),
    Upload(UploadAction),
    FetchResult { file: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_action_round_trips() {
        let action = Action::Run(RunAction {
            path: "ls".into(),
            args: vec!["-la".into()],
            env: vec![EnvVar {
                name: "HOME".into(),
                value: "/home/vcap".into(),
            }],
            resource_limits: ResourceLimits { nofile: Some(1024) },
            timeout_ms: Some(5000),
        });

        let json = serde_json::to_string(&action).unwrap();
        assert!(json.contains(r#""action":"run"#));
        let parsed: Action = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, action);
    }

    #[test]
    fn nested_composites_round_trip() {
        let action = Action::Serial {
            actions: vec![
                Action::Try {
                    action: Box::new(Action::Download(DownloadAction {
                        from: "http://example.com/droplet.tgz".into(),
                        to: "/app".into(),
                        cache_key: Some("droplet".into()),
                        user: "vcap".into(),
                        artifact_name: None,
                    })),
                },
                Action::Parallel {
                    actions: vec![Action::FetchResult {
                        file: "/tmp/result.json".into(),
                    }],
                },
            ],
        };

        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["action"], "serial");
        let parsed: Action = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, action);
    }

    #[test]
    fn unknown_variants_are_rejected() {
        let err = serde_json::from_str::<Action>(r#"{"action":"teleport","to":"mars"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn minimal_run_fills_defaults() {
        let parsed: Action = serde_json::from_str(r#"{"action":"run","path":"ls"}"#).unwrap();
        match parsed {
            Action::Run(run) => {
                assert!(run.args.is_empty());
                assert!(run.env.is_empty());
                assert_eq!(run.resource_limits, ResourceLimits::default());
                assert!(run.timeout_ms.is_none());
            }
            other => panic!("expected run action, got {other:?}"),
        }
    }
}
