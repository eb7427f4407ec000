//! The relay tunneling protocol: envelope codec, wire form, transforms and
//! the raw duplex bind used by passthrough tunnels.

pub mod bind;
pub mod codec;
pub mod status;
pub mod transform;
pub mod wire;

pub use bind::bind;
pub use codec::TunnelCodec;
pub use transform::{Identity, KeyedXor, WireTransform};

/// Header carrying the CONNECT target on a relay tunnel request.
pub const CONNECT_HOST: &str = "connect-host";

/// `Upgrade` token used when the relay switches a connection to a raw tunnel.
pub const TUNNEL_PROTOCOL: &str = "egress-tunnel";
