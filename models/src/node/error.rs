use snafu::Snafu;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Unable to list Nodes matching '{}': '{}'", selector, source))]
    ListNodes {
        source: kube::Error,
        selector: String,
    },

    #[snafu(display("Unable to get Node '{}': '{}'", name, source))]
    GetNode { source: kube::Error, name: String },

    #[snafu(display("Unable to cordon Node '{}': '{}'", name, source))]
    CordonNode { source: kube::Error, name: String },

    #[snafu(display("Unable to uncordon Node '{}': '{}'", name, source))]
    UncordonNode { source: kube::Error, name: String },

    #[snafu(display("Unable to patch labels of Node '{}': '{}'", name, source))]
    LabelNode { source: kube::Error, name: String },

    #[snafu(display("Unable to delete Node '{}': '{}'", name, source))]
    DeleteNode { source: kube::Error, name: String },

    #[snafu(display("Unable to list Pods on Node '{}': '{}'", node_name, source))]
    ListPods {
        source: kube::Error,
        node_name: String,
    },

    #[snafu(display("Unable to patch labels of Pod '{}': '{}'", pod_name, source))]
    LabelPod {
        source: kube::Error,
        pod_name: String,
    },

    #[snafu(display("Unable to delete Pod '{}': '{}'", pod_name, source))]
    DeletePod {
        source: kube::Error,
        pod_name: String,
    },

    #[snafu(display("Unable to discover the core API resources: '{}'", source))]
    DiscoverResources { source: kube::Error },

    #[snafu(display("Unable to get {} '{}': '{}'", kind, name, source))]
    GetObject {
        source: kube::Error,
        kind: String,
        name: String,
    },

    #[snafu(display("Unable to list {} objects matching '{}': '{}'", kind, selector, source))]
    ListObjects {
        source: kube::Error,
        kind: String,
        selector: String,
    },

    #[snafu(display("Unable to create {} '{}': '{}'", kind, name, source))]
    CreateObject {
        source: kube::Error,
        kind: String,
        name: String,
    },

    #[snafu(display("Unable to update status of {} '{}': '{}'", kind, name, source))]
    UpdateObjectStatus {
        source: kube::Error,
        kind: String,
        name: String,
    },

    #[snafu(display("Unable to delete {} '{}': '{}'", kind, name, source))]
    DeleteObject {
        source: kube::Error,
        kind: String,
        name: String,
    },

    #[snafu(display("Unable to publish event '{}': '{}'", reason, source))]
    PublishEvent { source: kube::Error, reason: String },

    #[snafu(display("Unable to create patch to send to Kubernetes API: '{}'", source))]
    CreateK8SPatch { source: serde_json::error::Error },

    #[snafu(display("{} object is missing its '{}'", kind, field))]
    MissingMetadata { kind: String, field: String },
}

impl Error {
    fn kube_source(&self) -> Option<&kube::Error> {
        match self {
            Self::ListNodes { source, .. }
            | Self::GetNode { source, .. }
            | Self::CordonNode { source, .. }
            | Self::UncordonNode { source, .. }
            | Self::LabelNode { source, .. }
            | Self::DeleteNode { source, .. }
            | Self::ListPods { source, .. }
            | Self::LabelPod { source, .. }
            | Self::DeletePod { source, .. }
            | Self::DiscoverResources { source }
            | Self::GetObject { source, .. }
            | Self::ListObjects { source, .. }
            | Self::CreateObject { source, .. }
            | Self::UpdateObjectStatus { source, .. }
            | Self::DeleteObject { source, .. }
            | Self::PublishEvent { source, .. } => Some(source),
            Self::CreateK8SPatch { .. } | Self::MissingMetadata { .. } => None,
        }
    }

    /// The HTTP status code returned by the API server, if the request got that far.
    pub fn status_code(&self) -> Option<u16> {
        match self.kube_source() {
            Some(kube::Error::Api(response)) => Some(response.code),
            _ => None,
        }
    }

    /// The object was modified since it was read.
    pub fn is_conflict(&self) -> bool {
        self.status_code() == Some(409)
    }

    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(404)
    }

    pub fn is_already_exists(&self) -> bool {
        self.is_conflict()
            && matches!(self.kube_source(), Some(kube::Error::Api(response)) if response.reason == "AlreadyExists")
    }
}

/// Builds an API error response, as the API server would return it.
pub fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{} ({})", reason, code),
        reason: reason.to_string(),
        code,
    })
}
