//! TCP transport for the framed media stream.

pub mod channel;

pub use channel::{
    ChannelConfig, ChannelSender, ChannelState, Endpoint, Inbound, TransportChannel,
    TransportEvent,
};
