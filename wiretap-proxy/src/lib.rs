mod config;
mod endpoint;
mod error;
mod handler;
mod intercept;
mod output;
mod queue;
mod role;

pub use config::{EndpointConfig, ListenConfig, RemoteConfig, TimeoutConfig};
pub use endpoint::{EndpointHandle, LifecycleState, ProxyEndpoint};
pub use error::ProxyError;
pub use handler::SocketHandler;
pub use intercept::{PacketInterceptor, Passthrough, PassthroughSettings};
pub use output::{ChannelSink, OutputLines, OutputSink, StdoutSink, output_channel};
pub use queue::OutboundQueue;
pub use role::SocketRole;
