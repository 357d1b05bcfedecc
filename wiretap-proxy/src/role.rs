use std::fmt;

use serde::{Deserialize, Serialize};

/// Which side of the proxy a socket or packet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SocketRole {
    Client,
    Server,
}

impl SocketRole {
    /// The role on the other side of the proxy.
    pub fn opposite(self) -> Self {
        match self {
            SocketRole::Client => SocketRole::Server,
            SocketRole::Server => SocketRole::Client,
        }
    }
}

impl fmt::Display for SocketRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketRole::Client => write!(f, "client"),
            SocketRole::Server => write!(f, "server"),
        }
    }
}
