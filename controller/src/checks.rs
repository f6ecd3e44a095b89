//! HTTP health checks run against individual nodes.
//!
//! Checks are made in three situations:
//! * Initial checks run once against the existing nodes before anything is cycled. Any failure
//!   is fatal.
//! * Cycling checks run against replacement nodes before old ones are drained. A failing check
//!   is retried until its wait period has passed.
//! * Pre-termination checks run against each old node before it is handed over for termination.
//!   A trigger endpoint is sent a single POST, then a health check is polled until it passes.
//!
//! All progress is kept in the request's status, keyed by node hash, so a check which has
//! passed is never repeated and a trigger is never sent twice.
use models::cycle::{
    format_timestamp, CycleError, CycleNodeRequestNode, HealthCheck, HealthCheckStatus,
    PreTerminationCheck, PreTerminationCheckStatus, TlsEnvVars,
};

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::{Certificate, Client, Identity, Method, StatusCode};
use snafu::{ensure, ResultExt};
use std::collections::BTreeMap;
use std::env;
use std::time::Duration;
use tracing::{event, instrument, Level};

pub use self::error::Error as CheckError;

lazy_static! {
    static ref NODE_IP_TEMPLATE: Regex = Regex::new(r"\{\{\s*\.NodeIP\s*\}\}").unwrap();
}

/// Whether every check has passed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CheckProgress {
    Complete,
    /// At least one check is failing but may still recover. Check again later.
    Pending,
}

/// Runs health checks, building a fresh HTTP client for each request so that TLS material is
/// read from the environment at the time of the check.
#[derive(Clone, Debug)]
pub struct HealthCheckEngine {
    timeout: Duration,
}

impl HealthCheckEngine {
    pub fn new(timeout: Duration) -> Self {
        HealthCheckEngine { timeout }
    }

    /// Performs a single GET against the check's endpoint for `node`.
    #[instrument(skip(self, check, node), fields(node = %node.name, endpoint = %check.endpoint), err)]
    pub async fn check(&self, check: &HealthCheck, node: &CycleNodeRequestNode) -> Result<()> {
        let endpoint = render_endpoint(&check.endpoint, node)?;
        let client = self.http_client(check.tls.as_ref())?;
        let response = client
            .request(Method::GET, &endpoint)
            .send()
            .await
            .context(error::RequestSnafu {
                endpoint: endpoint.clone(),
            })?;
        let status = response.status();

        match check.regex_match.as_deref().filter(|pattern| !pattern.is_empty()) {
            Some(pattern) => {
                let regex = Regex::new(pattern).context(error::InvalidRegexSnafu { pattern })?;
                let body = response.text().await.context(error::ReadBodySnafu {
                    endpoint: endpoint.clone(),
                })?;
                ensure!(
                    regex.is_match(&body),
                    error::UnhealthySnafu {
                        endpoint,
                        reason: format!("response body does not match '{}'", pattern),
                    }
                );
            }
            None => {
                ensure!(
                    status_accepted(&check.valid_status_codes, status),
                    error::UnhealthySnafu {
                        endpoint,
                        reason: format!("unexpected status code {}", status.as_u16()),
                    }
                );
            }
        }
        Ok(())
    }

    /// Sends the single POST which starts a pre-termination check for `node`.
    #[instrument(skip(self, check, node), fields(node = %node.name, endpoint = %check.trigger_endpoint), err)]
    pub async fn trigger(&self, check: &PreTerminationCheck, node: &CycleNodeRequestNode) -> Result<()> {
        let endpoint = render_endpoint(&check.trigger_endpoint, node)?;
        let client = self.http_client(check.tls.as_ref())?;
        let response = client
            .request(Method::POST, &endpoint)
            .send()
            .await
            .context(error::TriggerSnafu {
                endpoint: endpoint.clone(),
            })?;
        let status = response.status();
        ensure!(
            status_accepted(&check.trigger_valid_status_codes, status),
            error::TriggerRejectedSnafu {
                endpoint,
                status: status.as_u16(),
            }
        );
        Ok(())
    }

    /// Checks every node once. Any failure is fatal.
    pub async fn run_initial_health_checks(
        &self,
        checks: &[HealthCheck],
        nodes: &[CycleNodeRequestNode],
    ) -> Result<()> {
        for node in nodes {
            for check in checks {
                self.check(check, node).await?;
            }
        }
        Ok(())
    }

    /// Checks every node whose status is not yet marked `skip`.
    ///
    /// A node's first failure records when it started failing. Failures are tolerated until
    /// a check's wait period has passed since then, after which they are fatal. Nodes which
    /// pass every check are marked `skip`.
    pub async fn run_cycling_health_checks(
        &self,
        checks: &[HealthCheck],
        nodes: &[CycleNodeRequestNode],
        statuses: &mut BTreeMap<String, HealthCheckStatus>,
        now: DateTime<Utc>,
    ) -> Result<CheckProgress> {
        let mut progress = CheckProgress::Complete;

        for node in nodes {
            let status = statuses.entry(node.hash().to_string()).or_default();
            if status.skip {
                continue;
            }
            status.checks.resize(checks.len(), false);

            let mut node_passed = true;
            for (index, check) in checks.iter().enumerate() {
                if status.checks[index] {
                    continue;
                }
                match self.check(check, node).await {
                    Ok(()) => status.checks[index] = true,
                    Err(err) if err.is_retryable() => {
                        node_passed = false;
                        let failing_since = match status.node_ready().context(error::CorruptStatusSnafu)? {
                            Some(since) => since,
                            None => {
                                status.node_ready = Some(format_timestamp(now));
                                now
                            }
                        };
                        let wait_period = check.wait_period().context(error::InvalidSettingsSnafu)?;
                        ensure_within_wait_period(check, node, failing_since, wait_period, now, &err)?;
                        event!(
                            Level::INFO,
                            node = %node.name,
                            "Health check '{}' not yet passing: '{}'",
                            check.endpoint,
                            err
                        );
                    }
                    Err(err) => return Err(err),
                }
            }

            if node_passed {
                status.skip = true;
            } else {
                progress = CheckProgress::Pending;
            }
        }

        Ok(progress)
    }

    /// Triggers and then polls the pre-termination checks of every node.
    ///
    /// Wait periods are measured from when the trigger was sent. A trigger which fails or is
    /// rejected is fatal.
    pub async fn run_pre_termination_checks(
        &self,
        checks: &[PreTerminationCheck],
        nodes: &[CycleNodeRequestNode],
        statuses: &mut BTreeMap<String, Vec<PreTerminationCheckStatus>>,
        now: DateTime<Utc>,
    ) -> Result<CheckProgress> {
        let mut progress = CheckProgress::Complete;

        for node in nodes {
            let node_statuses = statuses.entry(node.hash().to_string()).or_default();
            node_statuses.resize(checks.len(), PreTerminationCheckStatus::default());

            for (check, status) in checks.iter().zip(node_statuses.iter_mut()) {
                if status.check {
                    continue;
                }

                let triggered = match status.trigger().context(error::CorruptStatusSnafu)? {
                    Some(triggered) => triggered,
                    None => {
                        self.trigger(check, node).await?;
                        status.trigger = Some(format_timestamp(now));
                        now
                    }
                };

                match self.check(&check.health_check, node).await {
                    Ok(()) => status.check = true,
                    Err(err) if err.is_retryable() => {
                        let wait_period = check
                            .health_check
                            .wait_period()
                            .context(error::InvalidSettingsSnafu)?;
                        ensure_within_wait_period(
                            &check.health_check,
                            node,
                            triggered,
                            wait_period,
                            now,
                            &err,
                        )?;
                        progress = CheckProgress::Pending;
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        Ok(progress)
    }

    fn http_client(&self, tls: Option<&TlsEnvVars>) -> Result<Client> {
        let mut builder = Client::builder().timeout(self.timeout);

        if let Some(tls) = tls {
            if let Some(root_ca) = read_pem(tls.root_ca_env_var.as_deref()) {
                let certificate = Certificate::from_pem(&root_ca).context(error::TlsMaterialSnafu {
                    env_var: tls.root_ca_env_var.clone().unwrap_or_default(),
                })?;
                builder = builder.add_root_certificate(certificate);
            }

            match (
                read_pem(tls.cert_env_var.as_deref()),
                read_pem(tls.key_env_var.as_deref()),
            ) {
                (Some(mut cert), Some(key)) => {
                    cert.push(b'\n');
                    cert.extend_from_slice(&key);
                    let identity = Identity::from_pem(&cert).context(error::TlsMaterialSnafu {
                        env_var: tls.cert_env_var.clone().unwrap_or_default(),
                    })?;
                    builder = builder.identity(identity);
                }
                (None, None) => {}
                _ => return error::IncompleteIdentitySnafu.fail(),
            }
        }

        builder.build().context(error::BuildClientSnafu)
    }
}

fn ensure_within_wait_period(
    check: &HealthCheck,
    node: &CycleNodeRequestNode,
    since: DateTime<Utc>,
    wait_period: Duration,
    now: DateTime<Utc>,
    last_error: &CheckError,
) -> Result<()> {
    let elapsed = (now - since).to_std().unwrap_or(Duration::ZERO);
    ensure!(
        elapsed < wait_period,
        error::WaitPeriodExceededSnafu {
            endpoint: check.endpoint.clone(),
            node: node.name.clone(),
            last_error: last_error.to_string(),
        }
    );
    Ok(())
}

/// Reads PEM material from the named environment variable. Unset or empty variables yield
/// nothing.
fn read_pem(env_var: Option<&str>) -> Option<Vec<u8>> {
    env_var
        .and_then(|name| env::var(name).ok())
        .filter(|value| !value.trim().is_empty())
        .map(String::into_bytes)
}

/// Substitutes the node's private address into an endpoint template.
fn render_endpoint(template: &str, node: &CycleNodeRequestNode) -> Result<String> {
    if !NODE_IP_TEMPLATE.is_match(template) {
        return Ok(template.to_string());
    }
    ensure!(
        !node.private_ip.is_empty(),
        error::MissingNodeIpSnafu {
            node: node.name.clone(),
        }
    );
    Ok(NODE_IP_TEMPLATE
        .replace_all(template, node.private_ip.as_str())
        .into_owned())
}

/// An empty list of valid codes accepts any 2xx response.
fn status_accepted(valid_status_codes: &[u16], status: StatusCode) -> bool {
    if valid_status_codes.is_empty() {
        status.is_success()
    } else {
        valid_status_codes.contains(&status.as_u16())
    }
}

type Result<T> = std::result::Result<T, error::Error>;

pub mod error {
    use super::CycleError;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to reach '{}': '{}'", endpoint, source))]
        Request {
            source: reqwest::Error,
            endpoint: String,
        },

        #[snafu(display("Unable to read response from '{}': '{}'", endpoint, source))]
        ReadBody {
            source: reqwest::Error,
            endpoint: String,
        },

        #[snafu(display("Check against '{}' failed: {}", endpoint, reason))]
        Unhealthy { endpoint: String, reason: String },

        #[snafu(display(
            "Check against '{}' for node '{}' did not pass within its wait period, last error: {}",
            endpoint,
            node,
            last_error
        ))]
        WaitPeriodExceeded {
            endpoint: String,
            node: String,
            last_error: String,
        },

        #[snafu(display("Unable to send trigger to '{}': '{}'", endpoint, source))]
        Trigger {
            source: reqwest::Error,
            endpoint: String,
        },

        #[snafu(display("Trigger '{}' rejected with status code {}", endpoint, status))]
        TriggerRejected { endpoint: String, status: u16 },

        #[snafu(display("Invalid response regex '{}': '{}'", pattern, source))]
        InvalidRegex {
            source: regex::Error,
            pattern: String,
        },

        #[snafu(display("Invalid health check settings: '{}'", source))]
        InvalidSettings { source: CycleError },

        #[snafu(display("Unable to read health check progress: '{}'", source))]
        CorruptStatus { source: CycleError },

        #[snafu(display("Node '{}' has no private IP to substitute into the endpoint", node))]
        MissingNodeIp { node: String },

        #[snafu(display("Invalid PEM material in environment variable '{}': '{}'", env_var, source))]
        TlsMaterial {
            source: reqwest::Error,
            env_var: String,
        },

        #[snafu(display("A client certificate and key must be given together"))]
        IncompleteIdentity,

        #[snafu(display("Unable to build HTTP client: '{}'", source))]
        BuildClient { source: reqwest::Error },
    }

    impl Error {
        /// Whether the check may pass if made again.
        pub fn is_retryable(&self) -> bool {
            matches!(
                self,
                Error::Request { .. } | Error::ReadBody { .. } | Error::Unhealthy { .. }
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn node(server: &MockServer) -> CycleNodeRequestNode {
        CycleNodeRequestNode {
            name: "ip-127-0-0-1".to_string(),
            provider_id: "aws:///us-east-1a/i-0new".to_string(),
            node_group_name: "workers".to_string(),
            private_ip: server.address().ip().to_string(),
        }
    }

    fn health_check(server: &MockServer, route: &str) -> HealthCheck {
        HealthCheck {
            endpoint: format!("http://{{{{.NodeIP}}}}:{}{}", server.address().port(), route),
            wait_period: Some("5m".to_string()),
            ..Default::default()
        }
    }

    fn engine() -> HealthCheckEngine {
        HealthCheckEngine::new(Duration::from_secs(5))
    }

    #[test]
    fn test_render_endpoint() {
        let node = CycleNodeRequestNode {
            name: "ip-10-0-0-1".to_string(),
            private_ip: "10.0.0.1".to_string(),
            ..Default::default()
        };
        assert_eq!(
            render_endpoint("https://{{.NodeIP}}:8443/healthz", &node).unwrap(),
            "https://10.0.0.1:8443/healthz"
        );
        assert_eq!(
            render_endpoint("http://{{ .NodeIP }}/", &node).unwrap(),
            "http://10.0.0.1/"
        );
        assert_eq!(
            render_endpoint("http://service.local/", &CycleNodeRequestNode::default()).unwrap(),
            "http://service.local/"
        );
        assert!(matches!(
            render_endpoint("http://{{.NodeIP}}/", &CycleNodeRequestNode::default()),
            Err(CheckError::MissingNodeIp { .. })
        ));
    }

    #[test]
    fn test_status_accepted() {
        assert!(status_accepted(&[], StatusCode::OK));
        assert!(status_accepted(&[], StatusCode::NO_CONTENT));
        assert!(!status_accepted(&[], StatusCode::SERVICE_UNAVAILABLE));
        assert!(status_accepted(&[200, 503], StatusCode::SERVICE_UNAVAILABLE));
        assert!(!status_accepted(&[200], StatusCode::NO_CONTENT));
    }

    #[tokio::test]
    async fn test_regex_decides_over_status_code() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(500).set_body_string(r#"{"state": "ready"}"#))
            .mount(&server)
            .await;

        let mut check = health_check(&server, "/status");
        check.regex_match = Some(r#""state": "ready""#.to_string());
        engine().check(&check, &node(&server)).await.unwrap();

        check.regex_match = Some("draining".to_string());
        let err = engine().check(&check, &node(&server)).await.unwrap_err();
        assert!(matches!(err, CheckError::Unhealthy { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_valid_status_codes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/healthz"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let mut check = health_check(&server, "/healthz");
        engine().check(&check, &node(&server)).await.unwrap();

        check.valid_status_codes = vec![200];
        assert!(engine().check(&check, &node(&server)).await.is_err());
    }

    #[tokio::test]
    async fn test_cycling_check_is_retryable_within_wait_period() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/healthz"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let checks = vec![health_check(&server, "/healthz")];
        let nodes = vec![node(&server)];
        let mut statuses = BTreeMap::new();
        let started = Utc::now();

        let progress = engine()
            .run_cycling_health_checks(&checks, &nodes, &mut statuses, started)
            .await
            .unwrap();
        assert_eq!(progress, CheckProgress::Pending);
        let status = &statuses[&nodes[0].hash().to_string()];
        assert_eq!(status.node_ready().unwrap(), Some(started));
        assert_eq!(status.checks, vec![false]);
        assert!(!status.skip);

        // Still failing, but within the wait period.
        let progress = engine()
            .run_cycling_health_checks(&checks, &nodes, &mut statuses, started + ChronoDuration::minutes(4))
            .await
            .unwrap();
        assert_eq!(progress, CheckProgress::Pending);

        // Out of time.
        let err = engine()
            .run_cycling_health_checks(&checks, &nodes, &mut statuses, started + ChronoDuration::minutes(6))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckError::WaitPeriodExceeded { .. }));
    }

    #[tokio::test]
    async fn test_cycling_checks_skip_passed_nodes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/healthz"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let checks = vec![health_check(&server, "/healthz")];
        let nodes = vec![node(&server)];
        let mut statuses = BTreeMap::new();

        for _ in 0..2 {
            let progress = engine()
                .run_cycling_health_checks(&checks, &nodes, &mut statuses, Utc::now())
                .await
                .unwrap();
            assert_eq!(progress, CheckProgress::Complete);
        }
        let status = &statuses[&nodes[0].hash().to_string()];
        assert!(status.skip);
        assert_eq!(status.checks, vec![true]);
    }

    #[tokio::test]
    async fn test_pre_termination_trigger_is_sent_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/drain"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/drained"))
            .respond_with(ResponseTemplate::new(200).set_body_string("pending"))
            .mount(&server)
            .await;

        let mut health_check = health_check(&server, "/drained");
        health_check.regex_match = Some("^done$".to_string());
        let checks = vec![PreTerminationCheck {
            trigger_endpoint: format!("http://{{{{.NodeIP}}}}:{}/drain", server.address().port()),
            trigger_valid_status_codes: vec![202],
            tls: None,
            health_check,
        }];
        let nodes = vec![node(&server)];
        let mut statuses = BTreeMap::new();
        let triggered = Utc::now();

        for minutes in [0, 2] {
            let progress = engine()
                .run_pre_termination_checks(
                    &checks,
                    &nodes,
                    &mut statuses,
                    triggered + ChronoDuration::minutes(minutes),
                )
                .await
                .unwrap();
            assert_eq!(progress, CheckProgress::Pending);
        }
        let status = &statuses[&nodes[0].hash().to_string()][0];
        assert!(status.trigger.is_some());
        assert!(!status.check);

        let err = engine()
            .run_pre_termination_checks(
                &checks,
                &nodes,
                &mut statuses,
                triggered + ChronoDuration::minutes(10),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CheckError::WaitPeriodExceeded { .. }));
    }

    #[tokio::test]
    async fn test_rejected_trigger_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/drain"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let checks = vec![PreTerminationCheck {
            trigger_endpoint: format!("http://{{{{.NodeIP}}}}:{}/drain", server.address().port()),
            health_check: health_check(&server, "/drained"),
            ..Default::default()
        }];
        let mut statuses = BTreeMap::new();
        let err = engine()
            .run_pre_termination_checks(&checks, &[node(&server)], &mut statuses, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, CheckError::TriggerRejected { status: 500, .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_incomplete_client_identity() {
        let server = MockServer::start().await;
        env::set_var("CYCLOPS_TEST_ONLY_CERT", "-----BEGIN CERTIFICATE-----");
        let mut check = health_check(&server, "/healthz");
        check.tls = Some(TlsEnvVars {
            root_ca_env_var: None,
            cert_env_var: Some("CYCLOPS_TEST_ONLY_CERT".to_string()),
            key_env_var: Some("CYCLOPS_TEST_UNSET_KEY".to_string()),
        });

        let err = engine().check(&check, &node(&server)).await.unwrap_err();
        assert!(matches!(err, CheckError::IncompleteIdentity));
        env::remove_var("CYCLOPS_TEST_ONLY_CERT");
    }
}
