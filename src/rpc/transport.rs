//! Component D: credit-based, multi-flow RPC transport. Grounded on
//! `inc/nu/utils/rpc.hpp` and `inc/nu/migrator.hpp`'s `MigratorConnManager`:
//! each destination node gets a small pool of TCP connections ("flows"),
//! one per core, each gated by a credit window (default 128 in-flight
//! requests) so a slow destination applies backpressure instead of letting
//! an unbounded number of requests queue up on the wire.
use crate::commons::NodeIp;
use crate::rpc::buffer::ReturnBuffer;
use crate::rpc::wire::{self, RpcType};
use crate::utils::err::{ERR_INTERNAL, ERR_TIMEOUT};
use crate::rtanyhow;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, Semaphore};
use tokio::time::{timeout, Duration};

pub const DEFAULT_CREDITS: u32 = 128;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// A single TCP connection to a peer, paired with the credit semaphore that
/// bounds how many requests can be outstanding on it at once.
struct Flow {
    writer: AsyncMutex<BufWriter<tokio::net::tcp::OwnedWriteHalf>>,
    pending: AsyncMutex<HashMap<u64, oneshot::Sender<(wire::RpcType, ReturnBuffer)>>>,
    credits: Semaphore,
    next_req_id: std::sync::atomic::AtomicU64,
}

impl Flow {
    async fn connect(addr: std::net::SocketAddr, credits: u32) -> anyhow::Result<Arc<Flow>> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| rtanyhow!(ERR_INTERNAL, "connect to {} failed: {}", addr, e))?;
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();
        let flow = Arc::new(Flow {
            writer: AsyncMutex::new(BufWriter::new(write_half)),
            pending: AsyncMutex::new(HashMap::new()),
            credits: Semaphore::new(credits as usize),
            next_req_id: std::sync::atomic::AtomicU64::new(0),
        });
        let reader_flow = flow.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            loop {
                let (ty, payload) = match wire::read_frame(&mut reader).await {
                    Ok(v) => v,
                    Err(_) => break,
                };
                if payload.len() < 8 {
                    continue;
                }
                let (id_bytes, body) = payload.split_at(8);
                let req_id = u64::from_be_bytes(id_bytes.try_into().unwrap());
                let mut pending = reader_flow.pending.lock().await;
                if let Some(sender) = pending.remove(&req_id) {
                    let _ = sender.send((ty, ReturnBuffer::from_vec(body.to_vec())));
                }
            }
        });
        Ok(flow)
    }

    async fn call(
        &self,
        rpc_type: RpcType,
        payload: &[u8],
        deadline: Duration,
    ) -> anyhow::Result<(RpcType, ReturnBuffer)> {
        let _permit = self
            .credits
            .acquire()
            .await
            .map_err(|e| rtanyhow!(ERR_INTERNAL, "credit semaphore closed: {}", e))?;
        let req_id = self
            .next_req_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(req_id, tx);
        let mut framed = Vec::with_capacity(8 + payload.len());
        framed.extend_from_slice(&req_id.to_be_bytes());
        framed.extend_from_slice(payload);
        {
            let mut writer = self.writer.lock().await;
            wire::write_frame(&mut *writer, rpc_type, &framed).await?;
            use tokio::io::AsyncWriteExt;
            writer
                .flush()
                .await
                .map_err(|e| rtanyhow!(ERR_INTERNAL, "flush failed: {}", e))?;
        }
        match timeout(deadline, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(rtanyhow!(ERR_INTERNAL, "flow closed before reply")),
            Err(_) => {
                self.pending.lock().await.remove(&req_id);
                Err(rtanyhow!(ERR_TIMEOUT, "rpc timed out after {:?}", deadline))
            }
        }
    }
}

/// Per-destination pool of flows, one per local core, matching
/// `MigratorConnManager`'s "reserve connections ahead of the transfer"
/// shape: `reserve` opens and warms the pool without making a call, so the
/// migration engine can pay connection-setup latency before it starts
/// quiescing the proclet.
struct FlowPool {
    addr: std::net::SocketAddr,
    flows: AsyncMutex<Vec<Arc<Flow>>>,
    credits: u32,
}

impl FlowPool {
    fn new(addr: std::net::SocketAddr, credits: u32) -> FlowPool {
        FlowPool {
            addr,
            flows: AsyncMutex::new(Vec::new()),
            credits,
        }
    }

    async fn reserve(&self, count: usize) -> anyhow::Result<()> {
        let mut flows = self.flows.lock().await;
        while flows.len() < count {
            flows.push(Flow::connect(self.addr, self.credits).await?);
        }
        Ok(())
    }

    async fn pick(&self, core: usize) -> anyhow::Result<Arc<Flow>> {
        {
            let flows = self.flows.lock().await;
            if let Some(f) = flows.get(core % flows.len().max(1)) {
                return Ok(f.clone());
            }
        }
        self.reserve(core + 1).await?;
        let flows = self.flows.lock().await;
        Ok(flows[core % flows.len()].clone())
    }
}

/// Top-level client-side transport: one `FlowPool` per destination node,
/// created lazily on first use and kept warm afterward (spec §4.D "per-core
/// TCP connections").
pub struct RpcClientMgr {
    pools: AsyncMutex<HashMap<NodeIp, Arc<FlowPool>>>,
    cores: usize,
    credits: u32,
    port: u16,
}

impl RpcClientMgr {
    pub fn new(cores: usize, credits: u32, port: u16) -> RpcClientMgr {
        RpcClientMgr {
            pools: AsyncMutex::new(HashMap::new()),
            cores: cores.max(1),
            credits,
            port,
        }
    }

    async fn pool_for(&self, dest: NodeIp) -> Arc<FlowPool> {
        let mut pools = self.pools.lock().await;
        pools
            .entry(dest)
            .or_insert_with(|| {
                Arc::new(FlowPool::new(
                    std::net::SocketAddr::new(dest.0.into(), self.port),
                    self.credits,
                ))
            })
            .clone()
    }

    /// Opens (or tops up) `self.cores` connections to `dest` ahead of time,
    /// the explicit `reserve_conns` step `inc/nu/migrator.hpp` takes before
    /// transferring migration data.
    pub async fn reserve_conns(&self, dest: NodeIp) -> anyhow::Result<()> {
        let pool = self.pool_for(dest).await;
        pool.reserve(self.cores).await
    }

    pub async fn call(
        &self,
        dest: NodeIp,
        core: usize,
        rpc_type: RpcType,
        payload: &[u8],
    ) -> anyhow::Result<(RpcType, ReturnBuffer)> {
        let pool = self.pool_for(dest).await;
        let flow = pool.pick(core).await?;
        flow.call(rpc_type, payload, DEFAULT_TIMEOUT).await
    }

    pub fn invalidate(&self, _dest: NodeIp) {
        // Connections stay open; only the id->host directory entry
        // (`proclet::status::StatusTable::invalidate_cache`) is invalidated
        // on a `WrongClient`, not the TCP flows themselves.
    }
}

/// Server-side half: accepts connections and dispatches frames to a handler.
/// `handler` gets the raw request body (request-id stripped) and must
/// return a reply body; this module takes care of the request-id echo and
/// framing so call sites only deal with typed payloads.
pub async fn serve<F, Fut>(
    listener: tokio::net::TcpListener,
    handler: Arc<F>,
) -> anyhow::Result<()>
where
    F: Fn(RpcType, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<(RpcType, Vec<u8>)>> + Send,
{
    loop {
        let (stream, _peer) = listener
            .accept()
            .await
            .map_err(|e| rtanyhow!(ERR_INTERNAL, "accept failed: {}", e))?;
        stream.set_nodelay(true).ok();
        let handler = handler.clone();
        tokio::spawn(async move {
            let (read_half, write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let writer = Arc::new(AsyncMutex::new(BufWriter::new(write_half)));
            let (tx, mut rx) = mpsc::unbounded_channel::<(u64, RpcType, Vec<u8>)>();
            let writer_task_w = writer.clone();
            let writer_task = tokio::spawn(async move {
                while let Some((req_id, ty, body)) = rx.recv().await {
                    let mut framed = Vec::with_capacity(8 + body.len());
                    framed.extend_from_slice(&req_id.to_be_bytes());
                    framed.extend_from_slice(&body);
                    let mut w = writer_task_w.lock().await;
                    if wire::write_frame(&mut *w, ty, &framed).await.is_err() {
                        break;
                    }
                    use tokio::io::AsyncWriteExt;
                    if w.flush().await.is_err() {
                        break;
                    }
                }
            });
            loop {
                let (ty, payload) = match wire::read_frame(&mut reader).await {
                    Ok(v) => v,
                    Err(_) => break,
                };
                if payload.len() < 8 {
                    continue;
                }
                let (id_bytes, body) = payload.split_at(8);
                let req_id = u64::from_be_bytes(id_bytes.try_into().unwrap());
                let handler = handler.clone();
                let tx = tx.clone();
                let body = body.to_vec();
                tokio::spawn(async move {
                    let reply = handler(ty, body).await;
                    let (reply_ty, reply_body) = reply.unwrap_or_else(|e| {
                        (
                            RpcType::InvokeReply,
                            format!("{:#}", e).into_bytes(),
                        )
                    });
                    let _ = tx.send((req_id, reply_ty, reply_body));
                });
            }
            writer_task.abort();
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn echoes_a_ping() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let handler = Arc::new(|ty: RpcType, body: Vec<u8>| async move { Ok((ty, body)) });
            serve(listener, handler).await.unwrap();
        });
        let mgr = RpcClientMgr::new(1, DEFAULT_CREDITS, addr.port());
        let dest = NodeIp(match addr.ip() {
            std::net::IpAddr::V4(v4) => v4,
            _ => unreachable!(),
        });
        let (ty, body) = mgr
            .call(dest, 0, RpcType::Ping, b"hi")
            .await
            .unwrap();
        assert_eq!(ty, RpcType::Ping);
        assert_eq!(body.as_slice(), b"hi");
    }
}
