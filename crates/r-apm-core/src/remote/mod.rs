//! ---
//! apm_section: "05-networking-external-interfaces"
//! apm_subsection: "module"
//! apm_type: "source"
//! apm_scope: "code"
//! apm_description: "Collector uplink: managed channel, decorators, health state machine."
//! apm_version: "v0.0.0-prealpha"
//! apm_owner: "tbd"
//! ---
//! The collector uplink. [`GrpcChannel`] owns one decorated transport
//! connection; [`ChannelManager`] keeps exactly one of them alive, detects
//! disconnection, fails over between endpoints, and broadcasts state
//! transitions to registered listeners.

mod channel;
mod manager;

pub use channel::{
    AgentIdDecorator, AuthenticationDecorator, CallableChannel, ChannelDecorator, ChannelError,
    DecoratorStack, GrpcChannel, GrpcChannelBuilder,
};
pub use manager::{is_network_error, ChannelListener, ChannelManager, ChannelStatus, IndexPicker};
