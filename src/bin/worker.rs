/*
Copyright 2020 <盏一 w@hidva.com>
Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at
http://www.apache.org/licenses/LICENSE-2.0
Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/
//! Worker node entry point: loads config, registers with the controller,
//! serves the proclet RPC surface, and runs the pressure monitor and
//! resource reporter loops.
use clap::Parser;
use nuproc::migration::MigrationMsg;
use nuproc::proclet::invoke::{InvokeRequest, InvokeResult};
use nuproc::rpc::transport;
use nuproc::rpc::wire::{self, RpcType};
use nuproc::utils::err::ERR_INTERNAL;
use nuproc::{config, pressure, rtanyhow, Node};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser, Debug)]
#[clap(name = "nuproc-worker", version)]
struct Args {
    /// Path to this node's YAML config file.
    #[clap(long, default_value = "nuproc.yaml")]
    config: String,
    /// This node's logical process id, unique within the cluster.
    #[clap(long)]
    lp: u32,
}

async fn serve_proclets(node: Arc<Node>) -> anyhow::Result<()> {
    let bind = std::net::SocketAddr::new(node.self_ip.0.into(), node.config.bind_port);
    let listener = TcpListener::bind(bind).await?;
    info!(%bind, "worker listening");
    let handler = Arc::new(move |ty: RpcType, body: Vec<u8>| {
        let node = node.clone();
        async move { handle_rpc(node, ty, body).await }
    });
    transport::serve(listener, handler).await
}

/// Top-level RPC dispatch for the worker surface: `Invoke` runs against the
/// local proclet table, falling back to a `WrongClient` reply (or, if this
/// node has an active forward entry for the id, transparently relaying the
/// call onward as `Forward`) for migrated-away ids. `Forward` is handled
/// identically to `Invoke` once it reaches whichever node actually hosts the
/// proclet. `CrossingInc`/`CrossingDec` adjust the distributed reference
/// count; `MigrationTransfer` lands a proclet arriving from another node.
async fn handle_rpc(node: Arc<Node>, ty: RpcType, body: Vec<u8>) -> anyhow::Result<(RpcType, Vec<u8>)> {
    match ty {
        RpcType::Ping => Ok((RpcType::Ping, body)),
        RpcType::Invoke => dispatch_invoke(node, body).await,
        RpcType::Forward => {
            let (_ty, reply) = dispatch_invoke(node, body).await?;
            Ok((RpcType::InvokeReply, reply))
        }
        RpcType::CrossingInc => {
            let id: nuproc::commons::ProcletId = wire::decode(&body)?;
            let result = node.proclets.crossing_inc(id);
            Ok((RpcType::InvokeReply, wire::encode(&result.is_ok())?))
        }
        RpcType::CrossingDec => {
            let id: nuproc::commons::ProcletId = wire::decode(&body)?;
            let result = node.proclets.crossing_dec(id);
            Ok((RpcType::InvokeReply, wire::encode(&result.is_ok())?))
        }
        RpcType::MigrationTransfer => {
            let msg: MigrationMsg = wire::decode(&body)?;
            match msg {
                MigrationMsg::Transfer(payload) => {
                    let type_tag = payload.type_tag.clone();
                    let types = node.types.clone();
                    let ack = node
                        .migrator()
                        .restore(payload, move |bytes| types.restore(&type_tag, bytes));
                    Ok((RpcType::MigrationAck, wire::encode(&ack)?))
                }
                MigrationMsg::Ack { .. } => Err(rtanyhow!(
                    ERR_INTERNAL,
                    "MigrationTransfer dispatch received an Ack, not a Transfer"
                )),
            }
        }
        other @ (RpcType::InvokeReply | RpcType::MigrationAck) => Err(rtanyhow!(
            ERR_INTERNAL,
            "{:?} is a reply type, never a request the server should dispatch",
            other
        )),
    }
}

/// Runs an `Invoke`/`Forward` payload against the local proclet table: on a
/// hit, replies with the method's result; on a miss, replies `WrongClient`
/// with whatever host this node's cache (or an active forward entry) thinks
/// is current, so the caller can retry there without a controller lookup.
async fn dispatch_invoke(node: Arc<Node>, body: Vec<u8>) -> anyhow::Result<(RpcType, Vec<u8>)> {
    let req: InvokeRequest = wire::decode(&body)?;
    let result = match node.proclets.dispatch_local(req.id, &req.method, &req.args) {
        Some(Ok(bytes)) => InvokeResult::Ok(bytes),
        Some(Err(e)) => InvokeResult::Err(format!("{:#}", e)),
        None => {
            let hinted = match node.forward.resolve(req.id).await {
                Some(dest) => Some(dest),
                None => node.proclets.status().cached_host(req.id),
            };
            InvokeResult::WrongClient { host: hinted }
        }
    };
    Ok((RpcType::InvokeReply, wire::encode(&result)?))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    nuproc::init_tracing();
    let args = Args::parse();
    let cfg = config::load(&args.config)?;
    let node = Arc::new(Node::new(cfg, args.lp));

    let self_ip = node.self_ip;
    let binary = std::fs::read(std::env::current_exe()?)?;
    node.controller
        .register_node(node.lp, self_ip, binary)
        .await?;
    info!(lp = node.lp, ip = %self_ip, "registered with controller");

    let monitor = pressure::Monitor::new(
        node.config.mem_quota_bytes,
        node.config.mem_low_watermark_bytes,
        tokio::time::Duration::from_millis(node.config.poll_interval_ms),
    );
    let reporter = pressure::ResourceReporter::new(
        node.lp,
        node.config.mem_quota_bytes,
        tokio::time::Duration::from_millis(node.config.report_interval_ms),
    );
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(monitor.run(node.live_bytes.clone(), node.cpu_load.clone(), tx));
    tokio::spawn(reporter.run(node.live_bytes.clone(), node.cpu_load.clone(), node.controller.clone()));
    tokio::spawn(async move {
        while let Some(trigger) = rx.recv().await {
            info!(?trigger, "pressure trigger observed");
        }
    });

    serve_proclets(node).await
}
