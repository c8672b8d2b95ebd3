//! Zero-copy reply ownership. Grounded on `inc/nu/utils/rpc.hpp`'s
//! `RPCReturnBuffer`: a reply's bytes are handed to the caller as a
//! reference-counted, shareable buffer instead of being copied again at
//! every layer that passes the reply upward (flow reader -> pending-request
//! map -> typed decode).
use bytes::Bytes;

#[derive(Debug, Clone, Default)]
pub struct ReturnBuffer(Bytes);

impl ReturnBuffer {
    pub fn from_vec(v: Vec<u8>) -> ReturnBuffer {
        ReturnBuffer(Bytes::from(v))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Splits off a sub-buffer without copying; used when a reply packs
    /// more than one logical value (e.g. a header plus a payload).
    pub fn slice(&self, range: std::ops::Range<usize>) -> ReturnBuffer {
        ReturnBuffer(self.0.slice(range))
    }
}

impl From<Vec<u8>> for ReturnBuffer {
    fn from(v: Vec<u8>) -> ReturnBuffer {
        ReturnBuffer::from_vec(v)
    }
}

impl AsRef<[u8]> for ReturnBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn slice_shares_storage_without_copying() {
        let buf = ReturnBuffer::from_vec(vec![1, 2, 3, 4, 5]);
        let mid = buf.slice(1..3);
        assert_eq!(mid.as_slice(), &[2, 3]);
        assert_eq!(buf.len(), 5);
    }
}
