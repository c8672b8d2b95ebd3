//! Component F: running a method call against a proclet, whichever node it
//! happens to live on right now. Grounded on `inc/nu/proclet.hpp`'s
//! `Proclet<T>::run`/`__run_and_get_loc`: try the local fast path first,
//! fall back to an RPC to the cached (or controller-looked-up) host, and
//! retry once against the fresh host if that host says it no longer has it.
use crate::commons::{NodeIp, ProcletId};
use crate::controller::client::ControllerClient;
use crate::proclet::ProcletTable;
use crate::rpc::wire::{self, RpcType};
use crate::rpc::RpcClientMgr;
use crate::utils::err::ERR_INTERNAL;
use crate::rtanyhow;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
pub struct InvokeRequest {
    pub id: ProcletId,
    pub method: String,
    pub args: Vec<u8>,
}

/// Reply to an `Invoke`/`Forward` RPC. `WrongClient` carries the cached host
/// the receiver believes is current, if it knows of one, so the caller can
/// retry without a second controller round trip.
#[derive(Serialize, Deserialize)]
pub enum InvokeResult {
    Ok(Vec<u8>),
    Err(String),
    WrongClient { host: Option<NodeIp> },
}

/// Runs `method(args)` against proclet `id`: locally if this node happens to
/// host it, over RPC otherwise. Retries exactly once against a corrected
/// host on a `WrongClient` reply, matching `rpc_client_mgr.hpp`'s
/// cache-invalidate-and-retry behavior.
pub async fn invoke(
    table: &ProcletTable,
    rpc: &RpcClientMgr,
    controller: &ControllerClient,
    core: usize,
    id: ProcletId,
    method: &str,
    args: &[u8],
) -> anyhow::Result<Vec<u8>> {
    if let Some(result) = table.dispatch_local(id, method, args) {
        return result;
    }

    let mut host = resolve_host(table, controller, id).await?;
    for attempt in 0..2 {
        let req = InvokeRequest {
            id,
            method: method.to_string(),
            args: args.to_vec(),
        };
        let payload = wire::encode(&req)?;
        let (_ty, reply_bytes) = rpc.call(host, core, RpcType::Invoke, &payload).await?;
        match wire::decode(reply_bytes.as_slice())? {
            InvokeResult::Ok(bytes) => return Ok(bytes),
            InvokeResult::Err(e) => return Err(rtanyhow!(ERR_INTERNAL, "{}", e)),
            InvokeResult::WrongClient { host: hinted } => {
                table.status().invalidate_cache(id);
                if attempt == 1 {
                    return Err(rtanyhow!(
                        ERR_INTERNAL,
                        "invoke: proclet {} kept reporting WrongClient",
                        id
                    ));
                }
                host = match hinted {
                    Some(h) => h,
                    None => controller.lookup(id).await?,
                };
                table.status().cache_host(id, host);
            }
        }
    }
    unreachable!("loop always returns by the second iteration")
}

/// Finds where `id` currently lives: the status table's cache first, a
/// controller lookup (cached for next time) otherwise.
async fn resolve_host(
    table: &ProcletTable,
    controller: &ControllerClient,
    id: ProcletId,
) -> anyhow::Result<NodeIp> {
    if let Some(host) = table.status().cached_host(id) {
        return Ok(host);
    }
    let host = controller.lookup(id).await?;
    table.status().cache_host(id, host);
    Ok(host)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn invoke_request_roundtrips_through_wire_encoding() {
        let req = InvokeRequest {
            id: ProcletId(0x8000_0000),
            method: "ping".to_string(),
            args: b"payload".to_vec(),
        };
        let bytes = wire::encode(&req).unwrap();
        let back: InvokeRequest = wire::decode(&bytes).unwrap();
        assert_eq!(back.id, req.id);
        assert_eq!(back.method, "ping");
        assert_eq!(back.args, b"payload");
    }

    #[test]
    fn invoke_result_wrong_client_roundtrips() {
        let host = NodeIp(std::net::Ipv4Addr::new(10, 0, 0, 5));
        let res = InvokeResult::WrongClient { host: Some(host) };
        let bytes = wire::encode(&res).unwrap();
        match wire::decode(&bytes).unwrap() {
            InvokeResult::WrongClient { host: Some(h) } => assert_eq!(h, host),
            _ => panic!("expected WrongClient"),
        }
    }
}
