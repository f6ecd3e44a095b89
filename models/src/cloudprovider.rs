//! The capabilities cycling needs from the cloud which runs the node groups.
//!
//! Concrete providers live outside this repository; they are handed to the controller as a
//! `CloudProvider` trait object.
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

#[cfg(any(test, feature = "mockall"))]
use mockall::{mock, predicate::*};

/// A cloud instance belonging to a node group.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Instance {
    /// The provider's own identifier for the instance, e.g. `i-0abc`.
    pub id: String,
    /// The Kubernetes providerID of the instance, e.g. `aws:///us-east-1a/i-0abc`.
    pub provider_id: String,
    pub node_group_name: String,
    /// Whether the instance was launched from an older configuration than its node group's.
    pub out_of_date: bool,
}

impl Instance {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn node_group_name(&self) -> &str {
        &self.node_group_name
    }

    pub fn out_of_date(&self) -> bool {
        self.out_of_date
    }

    /// Whether a Kubernetes node's providerID refers to this instance.
    pub fn matches_provider_id(&self, provider_id: &str) -> bool {
        provider_id == self.provider_id
            || provider_id.rsplit('/').next().map_or(false, |id| id == self.id)
    }
}

#[async_trait]
/// The instances of one or more node groups, as seen when they were fetched.
pub trait NodeGroups: Send + Sync {
    /// Every instance, keyed by providerID.
    fn instances(&self) -> BTreeMap<String, Instance>;
    /// Instances which are in service.
    fn ready_instances(&self) -> BTreeMap<String, Instance>;
    /// Instances which are launching, leaving or otherwise not in service.
    fn not_ready_instances(&self) -> BTreeMap<String, Instance>;
    /// Removes an instance from its node group without terminating it. The node group is
    /// expected to launch a replacement. Returns `true` if the instance was already detaching.
    async fn detach_instance(&self, provider_id: &str) -> ProviderResult<bool>;
    /// Returns a detached instance to a node group. Returns `true` if it was already attached.
    async fn attach_instance(&self, provider_id: &str, node_group_name: &str)
        -> ProviderResult<bool>;
}

#[async_trait]
pub trait CloudProvider: Send + Sync {
    fn name(&self) -> String;
    /// Returns the subset of the given providerIDs whose instances still exist.
    async fn instances_exist(&self, provider_ids: &[String]) -> ProviderResult<Vec<String>>;
    async fn get_node_groups(&self, names: &[String]) -> ProviderResult<Box<dyn NodeGroups>>;
    async fn terminate_instance(&self, provider_id: &str) -> ProviderResult<()>;
}

#[cfg(any(test, feature = "mockall"))]
mock! {
    /// A Mock CloudProvider for use in tests.
    pub CloudProvider {}
    #[async_trait]
    impl CloudProvider for CloudProvider {
        fn name(&self) -> String;
        async fn instances_exist(&self, provider_ids: &[String]) -> ProviderResult<Vec<String>>;
        async fn get_node_groups(&self, names: &[String]) -> ProviderResult<Box<dyn NodeGroups>>;
        async fn terminate_instance(&self, provider_id: &str) -> ProviderResult<()>;
    }
}

/// The error type returned by cloud providers.
#[derive(Debug)]
pub struct ProviderError {
    /// Any message to be included with the error. This will be included in the formatted display
    /// before `inner`.
    context: Option<String>,
    /// The error that caused this error.
    inner: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

impl ProviderError {
    pub fn new_with_source_and_context<S, E>(context: S, source: E) -> Self
    where
        S: Into<String>,
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    {
        Self {
            context: Some(context.into()),
            inner: Some(source.into()),
        }
    }

    pub fn new_with_context<S>(context: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            context: Some(context.into()),
            inner: None,
        }
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }
}

impl Display for ProviderError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match (self.context(), self.inner.as_ref()) {
            (Some(context), Some(inner)) => write!(f, "{}: {}", context, inner),
            (Some(context), None) => write!(f, "{}", context),
            (None, Some(inner)) => write!(f, "{}", inner),
            (None, None) => write!(f, "unknown cloud provider error"),
        }
    }
}

impl std::error::Error for ProviderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner
            .as_ref()
            .map(|inner| inner.as_ref() as &(dyn std::error::Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_provider_id() {
        let instance = Instance {
            id: "i-0abc".to_string(),
            provider_id: "aws:///us-east-1a/i-0abc".to_string(),
            node_group_name: "workers".to_string(),
            out_of_date: true,
        };
        assert!(instance.matches_provider_id("aws:///us-east-1a/i-0abc"));
        assert!(instance.matches_provider_id("aws:///us-east-1b/i-0abc"));
        assert!(!instance.matches_provider_id("aws:///us-east-1a/i-0abcd"));
        assert!(instance.out_of_date());
    }

    #[test]
    fn test_provider_error_display() {
        let err = ProviderError::new_with_source_and_context(
            "detaching i-0abc",
            "throttled".to_string(),
        );
        assert_eq!(err.to_string(), "detaching i-0abc: throttled");
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(
            ProviderError::new_with_context("no such group").to_string(),
            "no such group"
        );
    }
}
