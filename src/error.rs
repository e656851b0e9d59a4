use thiserror::Error;

/// Application-wide error types
#[derive(Error, Debug)]
pub enum ProxError {
    #[error("route name is empty")]
    EmptyRouteName,

    #[error("invalid cache time out duration format")]
    InvalidCacheDuration,

    #[error("invalid upstream time out duration format")]
    InvalidUpstreamDuration,

    #[error("invalid upstream host")]
    InvalidUpstreamHost,

    #[error("hostname is invalid")]
    InvalidHostname,

    #[error("all route request identifiers are empty, at least one is required")]
    EmptyRequestIdentifiers,

    #[error("all request identifiers are configured, only one per route host / path is allowed")]
    DuplicatedRequestIdentifier,

    #[error("both host request identifiers are configured, only one per route is allowed")]
    DuplicatedHostRequestIdentifier,

    #[error("both path request identifiers are configured, only one per route is allowed")]
    DuplicatedPathRequestIdentifier,

    #[error("invalid matcher expression: {0}")]
    InvalidMatcher(#[from] regex::Error),

    #[error("route already exists")]
    AlreadyExists,

    #[error("route not found")]
    NotFound,

    #[error("operation cancelled")]
    Cancelled,

    #[error("given file type is invalid, only .yaml or .yml is allowed")]
    InvalidFileType,

    #[error("static configuration has an invalid duplicated port configuration")]
    DuplicatedPortConfiguration,

    #[error("could not build upstream http client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("internal proxy error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, ProxError>;
