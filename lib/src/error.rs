use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("timeout elapsed while waiting for {0}")]
    Timeout(String),
    #[error("exhausted {0} attempts")]
    ExhaustedAttempts(usize),
    #[error("cancelled while waiting for {0}")]
    Cancelled(String),
    #[error("I/O failure")]
    Io(#[from] std::io::Error),
    #[error("error parsing json")]
    Serde(#[from] serde_json::Error),
    #[error("{operation} was rejected by the provider: {detail}")]
    Provider { operation: String, detail: String },
    #[error("provider response for {0} is missing {1}")]
    IncompleteResponse(String, &'static str),
    #[error("volume {0} is already attached")]
    VolumeInUse(String),
    #[error("`{command}` failed on {host}: {details}")]
    RemoteCommand {
        host: String,
        command: String,
        details: String,
    },
    #[error("`{command}` failed: {details}")]
    LocalCommand { command: String, details: String },
    #[error("host key scan of {0} returned no keys")]
    NoHostKey(String),
    #[error("syntax error in {0}")]
    SyntaxError(String),
    #[error("invalid cluster declaration: {0}")]
    Declaration(String),
    #[error("node name {0} is declared more than once")]
    DuplicateNode(String),
    #[error("node {node} has no {field} and there is no cluster default")]
    MissingField { node: String, field: &'static str },
    #[error("no such nodes in the cluster: {}", .0.join(", "))]
    UnknownNodes(Vec<String>),
    #[error("node {0} has no instance id")]
    NoInstance(String),
    #[error("node {0} has no reachable address")]
    NoAddress(String),
}

impl Error {
    pub(crate) fn provider<E: std::fmt::Display>(operation: &str, error: E) -> Self {
        Error::Provider {
            operation: operation.to_string(),
            detail: error.to_string(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
