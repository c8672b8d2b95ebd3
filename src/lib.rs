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
use static_assertions::const_assert;

pub mod archive;
pub mod commons;
pub mod config;
pub mod controller;
pub mod migration;
pub mod pressure;
pub mod proclet;
pub mod rpc;
pub mod scheduler;
pub mod slab;
pub mod stack;
pub mod sync;
pub mod thread;
pub mod utils;

pub const NUPROC_MAJOR: i32 = 0;
pub const NUPROC_MINOR: i32 = 1;
pub const NUPROC_PATCH: i32 = 0;
pub const NUPROC_VER: i32 = NUPROC_MAJOR * 100 * 100 + NUPROC_MINOR * 100 + NUPROC_PATCH;
pub const NUPROC_VERSTR: &str = "0.1.0";

const_assert!(commons::PAGE_SIZE.is_power_of_two());

/// Installs a process-wide `tracing` subscriber reading its filter from
/// `RUST_LOG` (or `info` if unset). Every RPC call in this crate runs inside
/// a span (`migration::Migrator::migrate` tags its whole nine-step run with
/// one), so a structured subscriber earns its keep here far more than plain
/// line logging would.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

/// Ties every per-node component together: the proclet table, slab
/// allocator, stack manager, RPC transport, controller client, and
/// migration engine all share this one bundle rather than being threaded
/// through call sites individually.
pub struct Node {
    pub config: config::Config,
    pub self_ip: commons::NodeIp,
    pub lp: commons::LpId,
    pub slabs: std::sync::Arc<slab::SlabTable>,
    pub stacks: std::sync::Arc<stack::StackManager>,
    pub proclets: std::sync::Arc<proclet::ProcletTable>,
    pub types: std::sync::Arc<proclet::TypeRegistry>,
    pub rpc: std::sync::Arc<rpc::RpcClientMgr>,
    pub controller: std::sync::Arc<controller::client::ControllerClient>,
    pub forward: std::sync::Arc<migration::ForwardTable>,
    pub cpu_load: std::sync::Arc<sync::CpuLoad>,
    pub live_bytes: std::sync::Arc<std::sync::atomic::AtomicU64>,
}

impl Node {
    /// Builds the node-local component bundle from a loaded `Config`. Does
    /// not register with the controller or start the background loops —
    /// the hosting binary (`bin/worker.rs`) drives those explicitly, so a
    /// `Node` can be constructed in tests without a live controller.
    pub fn new(config: config::Config, lp: commons::LpId) -> Node {
        let self_ip = commons::NodeIp(config.bind_addr);
        let slabs = std::sync::Arc::new(slab::SlabTable::new(config.cores as usize));
        let stacks = std::sync::Arc::new(stack::StackManager::new());
        let proclets = proclet::ProcletTable::new(self_ip, slabs.clone());
        let types = std::sync::Arc::new(proclet::TypeRegistry::new());
        let rpc = std::sync::Arc::new(rpc::RpcClientMgr::new(
            config.cores as usize,
            config.rpc_credits,
            config.bind_port,
        ));
        let controller_ip = commons::NodeIp(config.controller_addr);
        let controller = std::sync::Arc::new(controller::client::ControllerClient::new(
            rpc.clone(),
            controller_ip,
        ));
        let forward = std::sync::Arc::new(migration::ForwardTable::new());
        let cpu_load = std::sync::Arc::new(sync::CpuLoad::new());
        let live_bytes = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0));
        Node {
            config,
            self_ip,
            lp,
            slabs,
            stacks,
            proclets,
            types,
            rpc,
            controller,
            forward,
            cpu_load,
            live_bytes,
        }
    }

    pub fn migrator(&self) -> migration::Migrator {
        migration::Migrator::new(
            self.proclets.clone(),
            self.rpc.clone(),
            self.controller.clone(),
            self.forward.clone(),
            self.lp,
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn node_builds_from_default_config() {
        let node = Node::new(config::Config::default(), 1);
        assert_eq!(node.lp, 1);
        assert_eq!(node.config.cores, 1);
    }
}
