//! Length-prefixed RPC framing: `[u32 len][u8 rpc-type][payload]`. The shape
//! mirrors `protocol.rs`'s `read_message`/`write_message` (length-prefixed,
//! async `AsyncReadExt`/`AsyncWriteExt`), adapted to carry an RPC type byte
//! instead of a postgres message-type byte, and typed payloads serialized
//! with `bincode` rather than postgres's hand-rolled field encoding.
use crate::rtanyhow;
use crate::utils::err::ERR_INTERNAL;
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RpcType {
    Invoke = 0,
    InvokeReply = 1,
    Forward = 2,
    CrossingInc = 3,
    CrossingDec = 4,
    MigrationTransfer = 5,
    MigrationAck = 6,
    Ping = 7,
}

impl RpcType {
    pub fn from_u8(v: u8) -> anyhow::Result<RpcType> {
        Ok(match v {
            0 => RpcType::Invoke,
            1 => RpcType::InvokeReply,
            2 => RpcType::Forward,
            3 => RpcType::CrossingInc,
            4 => RpcType::CrossingDec,
            5 => RpcType::MigrationTransfer,
            6 => RpcType::MigrationAck,
            7 => RpcType::Ping,
            other => {
                return Err(rtanyhow!(ERR_INTERNAL, "unknown rpc type byte: {}", other))
            }
        })
    }
}

/// Cap on a single frame's payload, guarding against a corrupt length
/// prefix turning into an enormous allocation.
pub const MAX_FRAME_LEN: u32 = 256 * 1024 * 1024;

pub async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    rpc_type: RpcType,
    payload: &[u8],
) -> anyhow::Result<()> {
    let len = payload.len() as u32;
    w.write_u32(len).await.map_err(|e| {
        rtanyhow!(ERR_INTERNAL, "write_frame: length prefix failed: {}", e)
    })?;
    w.write_u8(rpc_type as u8)
        .await
        .map_err(|e| rtanyhow!(ERR_INTERNAL, "write_frame: type byte failed: {}", e))?;
    w.write_all(payload)
        .await
        .map_err(|e| rtanyhow!(ERR_INTERNAL, "write_frame: payload failed: {}", e))?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> anyhow::Result<(RpcType, Vec<u8>)> {
    let len = r
        .read_u32()
        .await
        .map_err(|e| rtanyhow!(ERR_INTERNAL, "read_frame: length prefix failed: {}", e))?;
    if len > MAX_FRAME_LEN {
        return Err(rtanyhow!(
            ERR_INTERNAL,
            "read_frame: frame too large: {} bytes",
            len
        ));
    }
    let ty = r
        .read_u8()
        .await
        .map_err(|e| rtanyhow!(ERR_INTERNAL, "read_frame: type byte failed: {}", e))?;
    let rpc_type = RpcType::from_u8(ty)?;
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)
        .await
        .map_err(|e| rtanyhow!(ERR_INTERNAL, "read_frame: payload failed: {}", e))?;
    Ok((rpc_type, payload))
}

pub fn encode<T: Serialize>(v: &T) -> anyhow::Result<Vec<u8>> {
    bincode::serialize(v).map_err(|e| rtanyhow!(ERR_INTERNAL, "encode failed: {}", e))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> anyhow::Result<T> {
    bincode::deserialize(bytes).map_err(|e| rtanyhow!(ERR_INTERNAL, "decode failed: {}", e))
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn roundtrips_a_frame() {
        let mut buf = Vec::new();
        write_frame(&mut buf, RpcType::Ping, b"hello").await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let (ty, payload) = read_frame(&mut cursor).await.unwrap();
        assert_eq!(ty, RpcType::Ping);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn encode_decode_roundtrip() {
        let msg = (1u32, "abc".to_string());
        let bytes = encode(&msg).unwrap();
        let back: (u32, String) = decode(&bytes).unwrap();
        assert_eq!(msg, back);
    }
}
