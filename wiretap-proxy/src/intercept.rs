use serde::{Deserialize, Serialize};

use crate::endpoint::EndpointHandle;
use crate::role::SocketRole;

/// Per-packet interception callback.
///
/// Invoked from a handler thread with the received bytes, a handle to the
/// owning endpoint and the role the bytes arrived from. The implementation
/// forwards, mutates or drops traffic by calling `endpoint.send_data` (or
/// not calling it, which drops the packet). The returned lines are passed to
/// the endpoint's output sink.
///
/// An interceptor is replaced at runtime by building a new instance and
/// swapping it in with [`crate::ProxyEndpoint::swap_interceptor`]; settings
/// live in a typed struct per implementation and are carried over by the
/// caller constructing the replacement.
pub trait PacketInterceptor: Send + Sync {
    fn on_packet(&self, data: &[u8], endpoint: &EndpointHandle, origin: SocketRole)
    -> Vec<String>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PassthroughSettings {
    /// Emit a line for every forwarded packet.
    pub announce: bool,
}

/// Forwards every packet unchanged to the opposite side.
#[derive(Debug, Default)]
pub struct Passthrough {
    settings: PassthroughSettings,
}

impl Passthrough {
    pub fn new(settings: PassthroughSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &PassthroughSettings {
        &self.settings
    }
}

impl PacketInterceptor for Passthrough {
    fn on_packet(
        &self,
        data: &[u8],
        endpoint: &EndpointHandle,
        origin: SocketRole,
    ) -> Vec<String> {
        endpoint.send_data(origin.opposite(), data.to_vec());
        if self.settings.announce {
            vec![format!(
                "{} bytes {} -> {}",
                data.len(),
                origin,
                origin.opposite()
            )]
        } else {
            Vec::new()
        }
    }
}
