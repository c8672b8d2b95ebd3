//! Dispatch loop binding a `Controller` to the RPC transport; run by the
//! dedicated controller binary (`bin/controller.rs`), mirroring how
//! `kb_controldata`/`initdb` are their own small binaries alongside `kuiba`.
use super::client::{Reply, Request};
use super::Controller;
use crate::rpc::wire::{self, RpcType};
use crate::rpc::transport;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

async fn handle(ctrl: Arc<Controller>, _ty: RpcType, body: Vec<u8>) -> anyhow::Result<(RpcType, Vec<u8>)> {
    let req: Request = wire::decode(&body)?;
    let reply = match req {
        Request::RegisterNode { lp, ip, binary } => match ctrl.register_node(lp, ip, &binary) {
            Ok(()) => Reply::Ok,
            Err(e) => Reply::Err(format!("{:#}", e)),
        },
        Request::UnregisterNode { lp } => {
            ctrl.unregister_node(lp);
            Reply::Ok
        }
        Request::AllocProcletId => match ctrl.alloc_proclet_id() {
            Ok(id) => Reply::ProcletId(id),
            Err(e) => Reply::Err(format!("{:#}", e)),
        },
        Request::AllocateProclet { capacity_bytes, hint_ip } => {
            match ctrl.allocate_proclet(capacity_bytes, hint_ip) {
                Ok((id, ip)) => Reply::ProcletPlacement(id, ip),
                Err(e) => Reply::Err(format!("{:#}", e)),
            }
        }
        Request::ReleaseProcletId { id } => {
            ctrl.release_proclet_id(id);
            Reply::Ok
        }
        Request::Lookup { id } => match ctrl.lookup(id) {
            Ok(ip) => Reply::NodeIp(ip),
            Err(e) => Reply::Err(format!("{:#}", e)),
        },
        Request::UpdateDirectory { id, host } => {
            ctrl.update_directory(id, host);
            Reply::Ok
        }
        Request::ReportResources {
            lp,
            free_mem_bytes,
            cpu_idle_frac,
        } => {
            ctrl.report_resources(lp, free_mem_bytes, cpu_idle_frac);
            Reply::Ok
        }
        Request::AcquireMigrationDest { exclude, mem_hint_bytes } => {
            match ctrl.acquire_migration_dest(exclude, mem_hint_bytes) {
                Ok(lp) => Reply::Lp(lp),
                Err(e) => Reply::Err(format!("{:#}", e)),
            }
        }
        Request::ReleaseMigrationDest { lp } => match ctrl.release_migration_dest(lp) {
            Ok(()) => Reply::Ok,
            Err(e) => Reply::Err(format!("{:#}", e)),
        },
        Request::NodeIpOf { lp } => match ctrl.node_ip(lp) {
            Ok(ip) => Reply::NodeIp(ip),
            Err(e) => Reply::Err(format!("{:#}", e)),
        },
    };
    Ok((RpcType::InvokeReply, wire::encode(&reply)?))
}

pub async fn run(ctrl: Arc<Controller>, bind: std::net::SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!(%bind, "controller listening");
    let handler = Arc::new(move |ty: RpcType, body: Vec<u8>| {
        let ctrl = ctrl.clone();
        async move { handle(ctrl, ty, body).await }
    });
    transport::serve(listener, handler).await
}
