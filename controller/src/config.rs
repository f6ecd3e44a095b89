//! Timing and concurrency settings for the controller.
//!
//! Defaults suit production. Each value can be overridden from the environment; durations are
//! written like `"90s"` or `"1h30m"`.
use crate::retry::RetryConfig;
use models::duration::{parse_duration, DurationError};

use snafu::ResultExt;
use std::env;
use std::time::Duration;

const TRANSITION_DURATION_ENV_VAR: &str = "CYCLOPS_TRANSITION_DURATION";
const SCALE_UP_WAIT_ENV_VAR: &str = "CYCLOPS_SCALE_UP_WAIT";
const SCALE_UP_LIMIT_ENV_VAR: &str = "CYCLOPS_SCALE_UP_LIMIT";
const NODE_EQUILIBRIUM_WAIT_LIMIT_ENV_VAR: &str = "CYCLOPS_NODE_EQUILIBRIUM_WAIT_LIMIT";
const NODE_SELECTION_WAIT_LIMIT_ENV_VAR: &str = "CYCLOPS_NODE_SELECTION_WAIT_LIMIT";
const NODE_TERMINATION_GRACE_PERIOD_ENV_VAR: &str = "CYCLOPS_NODE_TERMINATION_GRACE_PERIOD";
const DELETE_CNR_ENV_VAR: &str = "CYCLOPS_DELETE_CNR";
const DELETE_CNR_EXPIRY_ENV_VAR: &str = "CYCLOPS_DELETE_CNR_EXPIRY";
const DELETE_CNR_REQUEUE_ENV_VAR: &str = "CYCLOPS_DELETE_CNR_REQUEUE";
const HEALTH_CHECK_TIMEOUT_ENV_VAR: &str = "CYCLOPS_HEALTH_CHECK_TIMEOUT";
const NAMESPACE_ENV_VAR: &str = "CYCLOPS_NAMESPACE";
const CNS_CONCURRENCY_ENV_VAR: &str = "CYCLOPS_CNS_CONCURRENCY";

const DEFAULT_NAMESPACE: &str = "kube-system";
const DEFAULT_CNS_CONCURRENCY: usize = 25;

/// Timings used by both state machines.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransitionConfig {
    /// Delay between consecutive steps of a state machine.
    pub transition_duration: Duration,
    /// Minimum time to give a node group to launch replacements before checking on them.
    pub scale_up_wait: Duration,
    /// Time after which a node group which has not scaled up fails the request.
    pub scale_up_limit: Duration,
    /// How long Kubernetes and the cloud provider may disagree on the size of a node group.
    pub node_equilibrium_wait_limit: Duration,
    /// Longest delay between equilibrium checks.
    pub equilibrium_max_requeue: Duration,
    /// How long a request may wait on targets which are not ready, or claimed by another
    /// request, while none of its own nodes are being cycled.
    pub node_selection_wait_limit: Duration,
    /// How long a node may take to be drained, when its cycle settings do not say.
    pub node_termination_grace_period: Duration,
    pub wait_pods_requeue: Duration,
    pub remove_labels_requeue: Duration,
    /// Delay before retrying evictions refused to protect a PodDisruptionBudget.
    pub drain_blocked_requeue: Duration,
    pub drain_requeue: Duration,
    /// Whether successful requests delete themselves once `delete_cnr_expiry` has passed since
    /// their creation.
    pub delete_cnr_on_success: bool,
    pub delete_cnr_expiry: Duration,
    pub delete_cnr_requeue: Duration,
    pub health_check_timeout: Duration,
    /// Delay before a reconcile which returned an error is retried.
    pub error_requeue: Duration,
    pub conflict_retry: RetryConfig,
}

impl Default for TransitionConfig {
    fn default() -> Self {
        TransitionConfig {
            transition_duration: Duration::from_secs(10),
            scale_up_wait: Duration::from_secs(60),
            scale_up_limit: Duration::from_secs(20 * 60),
            node_equilibrium_wait_limit: Duration::from_secs(5 * 60),
            equilibrium_max_requeue: Duration::from_secs(60),
            node_selection_wait_limit: Duration::from_secs(30 * 60),
            node_termination_grace_period: Duration::from_secs(180 * 60),
            wait_pods_requeue: Duration::from_secs(60),
            remove_labels_requeue: Duration::from_secs(1),
            drain_blocked_requeue: Duration::from_secs(15),
            drain_requeue: Duration::from_secs(30),
            delete_cnr_on_success: false,
            delete_cnr_expiry: Duration::from_secs(7 * 24 * 3600),
            delete_cnr_requeue: Duration::from_secs(3600),
            health_check_timeout: Duration::from_secs(10),
            error_requeue: Duration::from_secs(30),
            conflict_retry: RetryConfig::default(),
        }
    }
}

impl TransitionConfig {
    pub fn from_environment() -> Result<Self> {
        let defaults = Self::default();
        Ok(TransitionConfig {
            transition_duration: duration_from_env(
                TRANSITION_DURATION_ENV_VAR,
                defaults.transition_duration,
            )?,
            scale_up_wait: duration_from_env(SCALE_UP_WAIT_ENV_VAR, defaults.scale_up_wait)?,
            scale_up_limit: duration_from_env(SCALE_UP_LIMIT_ENV_VAR, defaults.scale_up_limit)?,
            node_equilibrium_wait_limit: duration_from_env(
                NODE_EQUILIBRIUM_WAIT_LIMIT_ENV_VAR,
                defaults.node_equilibrium_wait_limit,
            )?,
            node_selection_wait_limit: duration_from_env(
                NODE_SELECTION_WAIT_LIMIT_ENV_VAR,
                defaults.node_selection_wait_limit,
            )?,
            node_termination_grace_period: duration_from_env(
                NODE_TERMINATION_GRACE_PERIOD_ENV_VAR,
                defaults.node_termination_grace_period,
            )?,
            delete_cnr_on_success: bool_from_env(DELETE_CNR_ENV_VAR, defaults.delete_cnr_on_success)?,
            delete_cnr_expiry: duration_from_env(
                DELETE_CNR_EXPIRY_ENV_VAR,
                defaults.delete_cnr_expiry,
            )?,
            delete_cnr_requeue: duration_from_env(
                DELETE_CNR_REQUEUE_ENV_VAR,
                defaults.delete_cnr_requeue,
            )?,
            health_check_timeout: duration_from_env(
                HEALTH_CHECK_TIMEOUT_ENV_VAR,
                defaults.health_check_timeout,
            )?,
            ..defaults
        })
    }
}

/// Where and how widely the reconcilers run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ControllerSettings {
    /// The namespace holding the cycling custom resources.
    pub namespace: String,
    /// How many CycleNodeStatus objects may be reconciled at once. Requests are always
    /// reconciled one at a time.
    pub cns_concurrency: usize,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        ControllerSettings {
            namespace: DEFAULT_NAMESPACE.to_string(),
            cns_concurrency: DEFAULT_CNS_CONCURRENCY,
        }
    }
}

impl ControllerSettings {
    pub fn from_environment() -> Result<Self> {
        let namespace = env::var(NAMESPACE_ENV_VAR).unwrap_or_else(|_| DEFAULT_NAMESPACE.to_string());
        let cns_concurrency = match env::var(CNS_CONCURRENCY_ENV_VAR) {
            Ok(value) => value
                .parse::<usize>()
                .ok()
                .filter(|concurrency| *concurrency > 0)
                .ok_or_else(|| config_error::Error::InvalidNumber {
                    env_var: CNS_CONCURRENCY_ENV_VAR.to_string(),
                    value,
                })?,
            Err(_) => DEFAULT_CNS_CONCURRENCY,
        };
        Ok(ControllerSettings {
            namespace,
            cns_concurrency,
        })
    }
}

fn duration_from_env(env_var: &str, default: Duration) -> Result<Duration> {
    match env::var(env_var) {
        Ok(value) => parse_duration(&value).context(config_error::InvalidDurationSnafu { env_var }),
        Err(_) => Ok(default),
    }
}

fn bool_from_env(env_var: &str, default: bool) -> Result<bool> {
    match env::var(env_var) {
        Ok(value) => value
            .to_lowercase()
            .parse()
            .context(config_error::InvalidBoolSnafu { env_var, value }),
        Err(_) => Ok(default),
    }
}

type Result<T> = std::result::Result<T, config_error::Error>;

pub mod config_error {
    use super::DurationError;
    use snafu::Snafu;
    use std::str::ParseBoolError;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Invalid duration in environment variable '{}': '{}'", env_var, source))]
        InvalidDuration {
            source: DurationError,
            env_var: String,
        },

        #[snafu(display("Invalid value '{}' in environment variable '{}': '{}'", value, env_var, source))]
        InvalidBool {
            source: ParseBoolError,
            env_var: String,
            value: String,
        },

        #[snafu(display(
            "Invalid value '{}' in environment variable '{}', expected a positive number",
            value,
            env_var
        ))]
        InvalidNumber { env_var: String, value: String },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_environment() {
        // Defaults
        for env_var in [
            TRANSITION_DURATION_ENV_VAR,
            SCALE_UP_WAIT_ENV_VAR,
            SCALE_UP_LIMIT_ENV_VAR,
            NODE_EQUILIBRIUM_WAIT_LIMIT_ENV_VAR,
            NODE_SELECTION_WAIT_LIMIT_ENV_VAR,
            NODE_TERMINATION_GRACE_PERIOD_ENV_VAR,
            DELETE_CNR_ENV_VAR,
            DELETE_CNR_EXPIRY_ENV_VAR,
            DELETE_CNR_REQUEUE_ENV_VAR,
            HEALTH_CHECK_TIMEOUT_ENV_VAR,
            NAMESPACE_ENV_VAR,
            CNS_CONCURRENCY_ENV_VAR,
        ] {
            env::remove_var(env_var);
        }
        assert_eq!(
            TransitionConfig::from_environment().unwrap(),
            TransitionConfig::default()
        );
        assert_eq!(
            ControllerSettings::from_environment().unwrap(),
            ControllerSettings::default()
        );

        // Overrides
        env::set_var(SCALE_UP_WAIT_ENV_VAR, "2m");
        env::set_var(NODE_TERMINATION_GRACE_PERIOD_ENV_VAR, "1h30m");
        env::set_var(NODE_SELECTION_WAIT_LIMIT_ENV_VAR, "45m");
        env::set_var(DELETE_CNR_ENV_VAR, "true");
        env::set_var(NAMESPACE_ENV_VAR, "cyclops");
        env::set_var(CNS_CONCURRENCY_ENV_VAR, "5");
        let config = TransitionConfig::from_environment().unwrap();
        assert_eq!(config.scale_up_wait, Duration::from_secs(120));
        assert_eq!(config.node_termination_grace_period, Duration::from_secs(5400));
        assert_eq!(config.node_selection_wait_limit, Duration::from_secs(45 * 60));
        assert!(config.delete_cnr_on_success);
        assert_eq!(config.transition_duration, Duration::from_secs(10));
        assert_eq!(
            ControllerSettings::from_environment().unwrap(),
            ControllerSettings {
                namespace: "cyclops".to_string(),
                cns_concurrency: 5,
            }
        );

        // Garbage
        env::set_var(SCALE_UP_WAIT_ENV_VAR, "a while");
        assert!(TransitionConfig::from_environment().is_err());
        env::remove_var(SCALE_UP_WAIT_ENV_VAR);
        env::set_var(DELETE_CNR_ENV_VAR, "maybe");
        assert!(TransitionConfig::from_environment().is_err());
        env::set_var(CNS_CONCURRENCY_ENV_VAR, "0");
        assert!(ControllerSettings::from_environment().is_err());

        for env_var in [
            NODE_TERMINATION_GRACE_PERIOD_ENV_VAR,
            NODE_SELECTION_WAIT_LIMIT_ENV_VAR,
            DELETE_CNR_ENV_VAR,
            NAMESPACE_ENV_VAR,
            CNS_CONCURRENCY_ENV_VAR,
        ] {
            env::remove_var(env_var);
        }
    }
}
