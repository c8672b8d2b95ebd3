//! Component D: RPC transport. See `transport` for the credit-based,
//! multi-flow client/server, `wire` for framing, `codes` for the
//! application-level return codes layered on top of the transport, and
//! `buffer` for the zero-copy reply ownership type replies are handed back
//! in.
pub mod buffer;
pub mod codes;
pub mod transport;
pub mod wire;

pub use buffer::ReturnBuffer;
pub use codes::ReturnCode;
pub use transport::RpcClientMgr;
