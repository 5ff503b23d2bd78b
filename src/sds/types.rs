use crate::cert::Certificate;
use std::sync::Arc;

/// A request from the proxy naming the secrets it wants.
///
/// The first request on a stream carries empty `version_info` and
/// `response_nonce`. Follow-ups echo the last response's nonce: without
/// `error_detail` they acknowledge it, with `error_detail` they reject it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SdsRequest {
    /// Requested resource names.
    pub resource_names: Vec<String>,
    /// Version of the last accepted response.
    pub version_info: String,
    /// Nonce of the response this request answers.
    pub response_nonce: String,
    /// Why the last response was rejected.
    pub error_detail: Option<String>,
    /// Identifier of the requesting node, for logs.
    pub node_id: Option<String>,
}

impl SdsRequest {
    /// Creates an initial request for `names`.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            resource_names: names.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Builds the acknowledgement of `response`, keeping the resource set.
    #[must_use]
    pub fn ack(&self, response: &SdsResponse) -> Self {
        Self {
            resource_names: self.resource_names.clone(),
            version_info: response.version_info.clone(),
            response_nonce: response.nonce.clone(),
            error_detail: None,
            node_id: self.node_id.clone(),
        }
    }

    /// Builds the rejection of `response`.
    #[must_use]
    pub fn nack(&self, response: &SdsResponse, detail: impl Into<String>) -> Self {
        Self {
            resource_names: self.resource_names.clone(),
            version_info: self.version_info.clone(),
            response_nonce: response.nonce.clone(),
            error_detail: Some(detail.into()),
            node_id: self.node_id.clone(),
        }
    }

    /// Requested names in order, without duplicates.
    pub(crate) fn unique_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::with_capacity(self.resource_names.len());
        for name in &self.resource_names {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }
}

/// One secret in a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretResource {
    /// Resource name.
    pub name: String,
    /// Install generation of this value.
    pub version: u64,
    /// The secret.
    pub certificate: Arc<Certificate>,
}

/// A response carrying the current value of every available requested secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdsResponse {
    /// Combined version of the resources, stable while none of them rotates.
    pub version_info: String,
    /// Unique per response; echoed by the next request.
    pub nonce: String,
    /// Available resources in request order. Resources without a value are omitted.
    pub resources: Vec<SecretResource>,
}

impl SdsResponse {
    /// Returns the resource named `name`, if present.
    pub fn resource(&self, name: &str) -> Option<&SecretResource> {
        self.resources.iter().find(|r| r.name == name)
    }

    /// Names of the resources carried, in order.
    pub fn resource_names(&self) -> Vec<&str> {
        self.resources.iter().map(|r| r.name.as_str()).collect()
    }
}

/// Formats the combined version of `resources`, e.g. `default=3,ROOTCA=1`.
pub(crate) fn version_info(resources: &[SecretResource]) -> String {
    resources
        .iter()
        .map(|r| format!("{}={}", r.name, r.version))
        .collect::<Vec<_>>()
        .join(",")
}
