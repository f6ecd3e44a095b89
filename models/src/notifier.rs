//! Optional announcements of cycling progress, e.g. to a chat channel.
use crate::cycle::{CycleNodeRequest, CycleNodeRequestNode};

use async_trait::async_trait;
use snafu::Snafu;

#[cfg(any(test, feature = "mockall"))]
use mockall::{mock, predicate::*};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum NotifierError {
    #[snafu(display("Unable to send notification: '{}'", source))]
    Send {
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

#[async_trait]
/// Receives notable events in the life of a CycleNodeRequest. Failures are logged by the caller
/// and never affect cycling.
pub trait Notifier: Send + Sync {
    async fn cycling_started(&self, cnr: &CycleNodeRequest) -> Result<(), NotifierError>;
    async fn phase_transitioned(&self, cnr: &CycleNodeRequest) -> Result<(), NotifierError>;
    async fn nodes_selected(
        &self,
        cnr: &CycleNodeRequest,
        nodes: &[CycleNodeRequestNode],
    ) -> Result<(), NotifierError>;
}

#[cfg(any(test, feature = "mockall"))]
mock! {
    /// A Mock Notifier for use in tests.
    pub Notifier {}
    #[async_trait]
    impl Notifier for Notifier {
        async fn cycling_started(&self, cnr: &CycleNodeRequest) -> Result<(), NotifierError>;
        async fn phase_transitioned(&self, cnr: &CycleNodeRequest) -> Result<(), NotifierError>;
        async fn nodes_selected(
            &self,
            cnr: &CycleNodeRequest,
            nodes: &[CycleNodeRequestNode],
        ) -> Result<(), NotifierError>;
    }
}
