//! Operator configuration from environment variables. Everything is optional
//! and defaulted; invalid values fail startup.

use std::time::Duration;

use k8s_openapi::api::core::v1::Taint;
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("could not parse {var}={value:?} as a duration"))]
    InvalidDuration {
        var: &'static str,
        value: String,
        source: humantime::DurationError,
    },

    #[snafu(display("{var} must be at least one minute, got {value:?}"))]
    IntervalTooShort { var: &'static str, value: String },

    #[snafu(display("{var}={value:?} must be an absolute path"))]
    NotAbsolute { var: &'static str, value: String },

    #[snafu(display("{var}={value:?} must reference an image with a tag"))]
    ImageWithoutTag { var: &'static str, value: String },

    #[snafu(display(
        "could not parse {var}={value:?} as a taint, expected key=value:effect"
    ))]
    InvalidTaint { var: &'static str, value: String },

    #[snafu(display("taint effect {effect:?} must be one of NoSchedule, PreferNoSchedule, NoExecute"))]
    InvalidTaintEffect { effect: String },
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Namespace the operator creates pods and configmaps in.
    pub namespace: String,

    /// Requeue interval while nothing is in flight.
    pub max_interval: Duration,

    /// Attached to created pods when non-empty.
    pub image_pull_secret: Option<String>,

    /// Host directory package payloads are copied under.
    pub copy_dir_root: String,

    /// Reset a node's package state when its boot id changes.
    pub reapply_on_reboot: bool,

    /// Taint kept on nodes until every runtime-required Skyhook targeting
    /// them is complete.
    pub runtime_required_taint: Taint,

    pub pause_image: String,
    pub agent_image: String,

    /// Host directory agents write their logs under.
    pub agent_log_root: String,

    pub webhook_secret_name: String,
    pub webhook_service_name: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        OperatorConfig {
            namespace: "skyhook".to_string(),
            max_interval: Duration::from_secs(600),
            image_pull_secret: None,
            copy_dir_root: "/var/lib/skyhook".to_string(),
            reapply_on_reboot: false,
            runtime_required_taint: parse_taint("skyhook.nvidia.com=uninitialized:NoSchedule")
                .expect("default taint is well formed"),
            pause_image: "registry.k8s.io/pause:3.10".to_string(),
            agent_image: "ghcr.io/nvidia/skyhook/agent:latest".to_string(),
            agent_log_root: "/var/log/skyhook".to_string(),
            webhook_secret_name: "skyhook-webhook-cert".to_string(),
            webhook_service_name: "skyhook-webhook".to_string(),
        }
    }
}

/// `key=value:effect`, the kubectl taint syntax.
pub fn parse_taint(raw: &str) -> Option<Taint> {
    let (kv, effect) = raw.rsplit_once(':')?;
    let (key, value) = kv.split_once('=')?;
    if key.is_empty() || effect.is_empty() {
        return None;
    }
    Some(Taint {
        key: key.to_string(),
        value: (!value.is_empty()).then(|| value.to_string()),
        effect: effect.to_string(),
        time_added: None,
    })
}

fn env(var: &'static str) -> Option<String> {
    std::env::var(var).ok().filter(|value| !value.is_empty())
}

impl OperatorConfig {
    /// Reads the configuration from the process environment, falling back to
    /// defaults per variable.
    pub fn from_env() -> Result<Self> {
        let mut config = OperatorConfig::default();

        if let Some(namespace) = env("NAMESPACE") {
            config.namespace = namespace;
        }

        if let Some(value) = env("DEFAULT_INTERVAL") {
            let interval = humantime::parse_duration(&value).context(InvalidDurationSnafu {
                var: "DEFAULT_INTERVAL",
                value: value.clone(),
            })?;
            snafu::ensure!(
                interval >= Duration::from_secs(60),
                IntervalTooShortSnafu {
                    var: "DEFAULT_INTERVAL",
                    value,
                }
            );
            config.max_interval = interval;
        }

        config.image_pull_secret = env("IMAGE_PULL_SECRET");

        if let Some(value) = env("COPY_DIR_ROOT") {
            snafu::ensure!(
                value.starts_with('/'),
                NotAbsoluteSnafu {
                    var: "COPY_DIR_ROOT",
                    value,
                }
            );
            config.copy_dir_root = value;
        }

        if let Some(value) = env("REAPPLY_ON_REBOOT") {
            config.reapply_on_reboot = value.eq_ignore_ascii_case("true");
        }

        if let Some(value) = env("RUNTIME_REQUIRED_TAINT") {
            let taint = parse_taint(&value).ok_or_else(|| Error::InvalidTaint {
                var: "RUNTIME_REQUIRED_TAINT",
                value: value.clone(),
            })?;
            snafu::ensure!(
                matches!(
                    taint.effect.as_str(),
                    "NoSchedule" | "PreferNoSchedule" | "NoExecute"
                ),
                InvalidTaintEffectSnafu {
                    effect: taint.effect.clone(),
                }
            );
            config.runtime_required_taint = taint;
        }

        for (var, field) in [
            ("PAUSE_IMAGE", &mut config.pause_image),
            ("AGENT_IMAGE", &mut config.agent_image),
        ] {
            if let Some(value) = env(var) {
                snafu::ensure!(value.contains(':'), ImageWithoutTagSnafu { var, value });
                *field = value;
            }
        }

        if let Some(value) = env("AGENT_LOG_ROOT") {
            config.agent_log_root = value;
        }
        if let Some(value) = env("WEBHOOK_SECRET_NAME") {
            config.webhook_secret_name = value;
        }
        if let Some(value) = env("WEBHOOK_SERVICE_NAME") {
            config.webhook_service_name = value;
        }

        Ok(config)
    }
}
