use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("proxy configuration error: {0}")]
    Config(String),
    #[error("proxy IO error: {0}")]
    Io(#[from] std::io::Error),
}
