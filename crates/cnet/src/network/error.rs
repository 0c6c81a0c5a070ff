//! Error taxonomy for the network manager and endpoint clients.

/// Result type for network operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the manager and its clients.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("subnet not found: {0}")]
    SubnetNotFound(String),

    #[error("network not found: {0}")]
    NetworkNotFound(String),

    #[error("network already exists: {0}")]
    NetworkExists(String),

    #[error("endpoint not found: {0}")]
    EndpointNotFound(String),

    #[error("endpoint already exists: {0}")]
    EndpointExists(String),

    #[error("endpoint in use: {0}")]
    EndpointInUse(String),

    #[error("endpoint not in use: {0}")]
    EndpointNotInUse(String),

    #[error("multiple endpoints found for pod {pod} in namespace {namespace}")]
    MultipleEndpointsFound { pod: String, namespace: String },

    #[error("invalid network mode: {0}")]
    InvalidNetworkMode(String),

    #[error("malformed IP address: {0}")]
    MalformedIp(String),

    #[error("external interface not found: {0}")]
    ExternalInterfaceNotFound(String),

    #[error("store lock timed out after {0:?}")]
    StoreLockTimeout(std::time::Duration),

    #[error("store key not found: {0}")]
    StoreKeyNotFound(String),

    /// A lower-level failure, attributed to the client variant it escaped
    /// from.
    #[error("{client}: {source}")]
    Client {
        client: &'static str,
        #[source]
        source: Box<Error>,
    },

    #[error("netlink: {0}")]
    Netlink(#[from] crate::netlink::Error),

    #[error(transparent)]
    Exec(#[from] crate::platform::ExecError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state serialization: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Attribute an error to a client variant so failures name the layer
    /// they escaped from.
    pub fn in_client(self, client: &'static str) -> Self {
        match self {
            already @ Self::Client { .. } => already,
            source => Self::Client {
                client,
                source: Box::new(source),
            },
        }
    }
}

/// Extension for attributing results to a client variant.
pub(crate) trait ClientContext<T> {
    fn client(self, name: &'static str) -> Result<T>;
}

impl<T, E: Into<Error>> ClientContext<T> for std::result::Result<T, E> {
    fn client(self, name: &'static str) -> Result<T> {
        self.map_err(|e| e.into().in_client(name))
    }
}
