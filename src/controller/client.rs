//! Worker-side stub for talking to the controller, grounded on
//! `inc/nu/ctrl_client.hpp`: every call is a single request/reply RPC over
//! the same credit-based transport used between worker nodes (the
//! controller is just another RPC peer, it gets no special-cased wire
//! format).
use crate::commons::{LpId, NodeIp, ProcletId};
use crate::rpc::wire::{self, RpcType};
use crate::rpc::RpcClientMgr;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Serialize, Deserialize)]
pub enum Request {
    RegisterNode { lp: LpId, ip: NodeIp, binary: Vec<u8> },
    UnregisterNode { lp: LpId },
    AllocProcletId,
    AllocateProclet { capacity_bytes: u64, hint_ip: Option<NodeIp> },
    ReleaseProcletId { id: ProcletId },
    Lookup { id: ProcletId },
    UpdateDirectory { id: ProcletId, host: NodeIp },
    ReportResources { lp: LpId, free_mem_bytes: u64, cpu_idle_frac: f64 },
    AcquireMigrationDest { exclude: LpId, mem_hint_bytes: u64 },
    ReleaseMigrationDest { lp: LpId },
    NodeIpOf { lp: LpId },
}

#[derive(Serialize, Deserialize)]
pub enum Reply {
    Ok,
    ProcletId(ProcletId),
    ProcletPlacement(ProcletId, NodeIp),
    NodeIp(NodeIp),
    Lp(LpId),
    Err(String),
}

/// Thin client: resolves the controller's address once at construction and
/// reuses the same `RpcClientMgr` worker nodes use for proclet-to-proclet
/// calls, so controller traffic shares the per-core flow pool rather than
/// opening a second connection class.
pub struct ControllerClient {
    rpc: Arc<RpcClientMgr>,
    addr: NodeIp,
}

impl ControllerClient {
    pub fn new(rpc: Arc<RpcClientMgr>, addr: NodeIp) -> ControllerClient {
        ControllerClient { rpc, addr }
    }

    async fn roundtrip(&self, req: Request) -> anyhow::Result<Reply> {
        let payload = wire::encode(&req)?;
        let (_ty, body) = self
            .rpc
            .call(self.addr, 0, RpcType::Invoke, &payload)
            .await?;
        wire::decode(body.as_slice())
    }

    pub async fn register_node(&self, lp: LpId, ip: NodeIp, binary: Vec<u8>) -> anyhow::Result<()> {
        match self
            .roundtrip(Request::RegisterNode { lp, ip, binary })
            .await?
        {
            Reply::Ok => Ok(()),
            Reply::Err(e) => Err(anyhow::anyhow!(e)),
            _ => Err(anyhow::anyhow!("register_node: unexpected reply")),
        }
    }

    pub async fn alloc_proclet_id(&self) -> anyhow::Result<ProcletId> {
        match self.roundtrip(Request::AllocProcletId).await? {
            Reply::ProcletId(id) => Ok(id),
            Reply::Err(e) => Err(anyhow::anyhow!(e)),
            _ => Err(anyhow::anyhow!("alloc_proclet_id: unexpected reply")),
        }
    }

    /// Allocates a proclet id and picks its home node in one round trip
    /// (spec §4.E `allocate_proclet`). `hint_ip`, when given, is honored as
    /// long as that node still has enough free memory to qualify.
    pub async fn allocate_proclet(
        &self,
        capacity_bytes: u64,
        hint_ip: Option<NodeIp>,
    ) -> anyhow::Result<(ProcletId, NodeIp)> {
        match self
            .roundtrip(Request::AllocateProclet { capacity_bytes, hint_ip })
            .await?
        {
            Reply::ProcletPlacement(id, ip) => Ok((id, ip)),
            Reply::Err(e) => Err(anyhow::anyhow!(e)),
            _ => Err(anyhow::anyhow!("allocate_proclet: unexpected reply")),
        }
    }

    pub async fn lookup(&self, id: ProcletId) -> anyhow::Result<NodeIp> {
        match self.roundtrip(Request::Lookup { id }).await? {
            Reply::NodeIp(ip) => Ok(ip),
            Reply::Err(e) => Err(anyhow::anyhow!(e)),
            _ => Err(anyhow::anyhow!("lookup: unexpected reply")),
        }
    }

    pub async fn update_directory(&self, id: ProcletId, host: NodeIp) -> anyhow::Result<()> {
        match self.roundtrip(Request::UpdateDirectory { id, host }).await? {
            Reply::Ok => Ok(()),
            Reply::Err(e) => Err(anyhow::anyhow!(e)),
            _ => Err(anyhow::anyhow!("update_directory: unexpected reply")),
        }
    }

    pub async fn report_resources(
        &self,
        lp: LpId,
        free_mem_bytes: u64,
        cpu_idle_frac: f64,
    ) -> anyhow::Result<()> {
        match self
            .roundtrip(Request::ReportResources {
                lp,
                free_mem_bytes,
                cpu_idle_frac,
            })
            .await?
        {
            Reply::Ok => Ok(()),
            Reply::Err(e) => Err(anyhow::anyhow!(e)),
            _ => Err(anyhow::anyhow!("report_resources: unexpected reply")),
        }
    }

    pub async fn acquire_migration_dest(&self, exclude: LpId, mem_hint_bytes: u64) -> anyhow::Result<LpId> {
        match self
            .roundtrip(Request::AcquireMigrationDest { exclude, mem_hint_bytes })
            .await?
        {
            Reply::Lp(lp) => Ok(lp),
            Reply::Err(e) => Err(anyhow::anyhow!(e)),
            _ => Err(anyhow::anyhow!("acquire_migration_dest: unexpected reply")),
        }
    }

    pub async fn release_migration_dest(&self, lp: LpId) -> anyhow::Result<()> {
        match self.roundtrip(Request::ReleaseMigrationDest { lp }).await? {
            Reply::Ok => Ok(()),
            Reply::Err(e) => Err(anyhow::anyhow!(e)),
            _ => Err(anyhow::anyhow!("release_migration_dest: unexpected reply")),
        }
    }

    pub async fn lookup_node(&self, lp: LpId) -> anyhow::Result<NodeIp> {
        match self.roundtrip(Request::NodeIpOf { lp }).await? {
            Reply::NodeIp(ip) => Ok(ip),
            Reply::Err(e) => Err(anyhow::anyhow!(e)),
            _ => Err(anyhow::anyhow!("lookup_node: unexpected reply")),
        }
    }
}
