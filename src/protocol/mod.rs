//! Host/plugin protocol: the handshake line and the framed RPC messages.

pub mod handshake;
pub mod wire;

pub use handshake::{negotiate, HandshakeLine, TransportKind};
pub use wire::{
    HeaderMultimap, RouteKind, RouteSpec, RpcCall, RpcReply, RpcRequest, RpcResponse,
    SerializedRequest, SerializedResponse,
};
