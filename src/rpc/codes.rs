//! RPC return codes (spec §4.D): every RPC reply carries one of these
//! instead of piggy-backing failure on the transport layer, since a
//! "failure" here can mean the call reached a live peer that simply isn't
//! the right one anymore.
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ReturnCode {
    /// Handled by the receiver as the actual callee.
    Ok = 0,
    /// The receiver used to host this proclet but no longer does; the
    /// caller should invalidate its directory cache entry and re-resolve.
    WrongClient = 1,
    /// The receiver is mid-migration for this proclet and forwarded the
    /// call onward on the caller's behalf (spec §4.G "request forwarding").
    Forwarded = 2,
    /// No reply arrived within the flow's timeout.
    Timeout = 3,
}

impl ReturnCode {
    pub fn from_u8(v: u8) -> Option<ReturnCode> {
        match v {
            0 => Some(ReturnCode::Ok),
            1 => Some(ReturnCode::WrongClient),
            2 => Some(ReturnCode::Forwarded),
            3 => Some(ReturnCode::Timeout),
            _ => None,
        }
    }
}
