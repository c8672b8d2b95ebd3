// Copyright 2020 <盏一 w@hidva.com>
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
// http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

/// Stable error codes surfaced across an RPC boundary, mirroring `kuiba`'s
/// `ERRCODE_*` constants but scoped to the proclet runtime's own failure
/// modes.
pub const ERR_WRONG_CLIENT: &str = "ERR_WRONG_CLIENT";
pub const ERR_TIMEOUT: &str = "ERR_TIMEOUT";
pub const ERR_ALLOC_FAILURE: &str = "ERR_ALLOC_FAILURE";
pub const ERR_CONTROLLER_UNAVAILABLE: &str = "ERR_CONTROLLER_UNAVAILABLE";
pub const ERR_BINARY_MISMATCH: &str = "ERR_BINARY_MISMATCH";
pub const ERR_NO_FREE_SLOT: &str = "ERR_NO_FREE_SLOT";
pub const ERR_MIGRATION_ABORTED: &str = "ERR_MIGRATION_ABORTED";
pub const ERR_INTERNAL: &str = "ERR_INTERNAL";

#[derive(Debug)]
pub struct ErrCtx {
    pub code: &'static str,
    pub msg: String,
}

impl std::fmt::Display for ErrCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.msg)
    }
}

pub fn errcode(err: &anyhow::Error) -> &'static str {
    match err.downcast_ref::<ErrCtx>() {
        Some(errctx) => errctx.code,
        None => ERR_INTERNAL,
    }
}

#[macro_export]
macro_rules! rtctx {
    ($code:expr, $msg:literal $(,)?) => {
        $crate::utils::err::ErrCtx {
            code: $code,
            msg: $msg.to_string(),
        }
    };
    ($code:expr, $fmt:expr, $($arg:tt)*) => {
        $crate::utils::err::ErrCtx {
            code: $code,
            msg: format!($fmt, $($arg)*),
        }
    };
}

#[macro_export]
macro_rules! rtanyhow {
    ($code:expr, $msg:literal $(,)?) => {
        anyhow::anyhow!("").context($crate::rtctx!($code, $msg))
    };
    ($code:expr, $fmt:expr, $($arg:tt)*) => {
        anyhow::anyhow!("").context($crate::rtctx!($code, $fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! rtbail {
    ($code:expr, $msg:literal $(,)?) => {
        return Err($crate::rtanyhow!($code, $msg))
    };
    ($code:expr, $fmt:expr, $($arg:tt)*) => {
        return Err($crate::rtanyhow!($code, $fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! rtensure {
    ($cond:expr, $code:expr, $msg:literal $(,)?) => {
        if !$cond {
            return Err($crate::rtanyhow!($code, $msg));
        }
    };
    ($cond:expr, $code:expr, $fmt:expr, $($arg:tt)*) => {
        if !$cond {
            return Err($crate::rtanyhow!($code, $fmt, $($arg)*));
        }
    };
}
