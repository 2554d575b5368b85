use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("truncated input reading {0}")]
    Truncated(&'static str),
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("unsupported protocol version {0}, only IPFIX (10) is accepted")]
    UnsupportedVersion(u16),
    #[error("no template {1} for observation domain {0}")]
    UnknownTemplate(u32, u16),
    #[error("template {1} for observation domain {0} has expired")]
    TemplateExpired(u32, u16),
    #[error("io error")]
    Io(#[from] std::io::Error),
    #[error("tls error: {0}")]
    Tls(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("queue terminated")]
    QueueTerminated,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
