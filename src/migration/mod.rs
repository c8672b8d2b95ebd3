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
//! Component G: the migration engine. Grounded on `inc/nu/migrator.hpp`'s
//! nine-step protocol: acquire a destination, reserve connections ahead of
//! the transfer, quiesce the proclet, mark its threads as migrating,
//! transmit heap+thread+sync state, install forwarding on the source,
//! resume on the destination, update the controller's directory, then
//! release the source-side bookkeeping.
use crate::commons::{LpId, NodeIp, ProcletId};
use crate::controller::client::ControllerClient;
use crate::proclet::ProcletTable;
use crate::rpc::wire::{self, RpcType};
use crate::rpc::RpcClientMgr;
use crate::utils::err::{ERR_INTERNAL, ERR_MIGRATION_ABORTED};
use crate::rtanyhow;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, info_span, Instrument};

/// On-the-wire migration payload: the proclet's serialized heap (produced
/// by the caller's `serialize` hook, type-erased here since the migration
/// engine itself doesn't know the proclet's concrete Rust type — only the
/// call site constructing a `MigrationRequest` does, the same way
/// `access/wal.rs` records are opaque bytes to the generic WAL machinery
/// that writes them).
#[derive(Serialize, Deserialize)]
pub struct MigrationPayload {
    pub id: ProcletId,
    /// Identifies the concrete proclet type to the destination's
    /// `proclet::TypeRegistry`, since a raw Rust type can't be recovered
    /// from bytes alone the way a C++ vtable pointer would carry it.
    pub type_tag: String,
    pub state: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
pub enum MigrationMsg {
    Transfer(MigrationPayload),
    Ack { id: ProcletId, ok: bool, error: Option<String> },
}

/// Forwarding table: while a proclet is mid-migration, calls that land on
/// the source after the heap has already left are redirected here instead
/// of failing outright (spec §4.G "install forwarding").
#[derive(Default)]
pub struct ForwardTable {
    inner: AsyncMutex<std::collections::HashMap<ProcletId, NodeIp>>,
}

impl ForwardTable {
    pub fn new() -> ForwardTable {
        ForwardTable::default()
    }

    pub async fn install(&self, id: ProcletId, dest: NodeIp) {
        self.inner.lock().await.insert(id, dest);
    }

    pub async fn resolve(&self, id: ProcletId) -> Option<NodeIp> {
        self.inner.lock().await.get(&id).copied()
    }

    pub async fn clear(&self, id: ProcletId) {
        self.inner.lock().await.remove(&id);
    }
}

/// Ties the proclet table, RPC transport, controller client and forward
/// table together to run the migration protocol. One instance per node.
pub struct Migrator {
    table: Arc<ProcletTable>,
    rpc: Arc<RpcClientMgr>,
    controller: Arc<ControllerClient>,
    forward: Arc<ForwardTable>,
    self_lp: LpId,
}

impl Migrator {
    pub fn new(
        table: Arc<ProcletTable>,
        rpc: Arc<RpcClientMgr>,
        controller: Arc<ControllerClient>,
        forward: Arc<ForwardTable>,
        self_lp: LpId,
    ) -> Migrator {
        Migrator {
            table,
            rpc,
            controller,
            forward,
            self_lp,
        }
    }

    /// Drives the full nine-step protocol for `id`, with `serialize`
    /// producing the heap+thread+sync-state bytes to ship (already quiesced
    /// by the time it's called — see step 3 below).
    pub async fn migrate(
        &self,
        id: ProcletId,
        type_tag: &str,
        mem_hint_bytes: u64,
        serialize: impl FnOnce() -> anyhow::Result<Vec<u8>>,
    ) -> anyhow::Result<NodeIp> {
        let span = info_span!("migrate", %id);
        async {
            // 1. acquire destination
            let dest_lp = self
                .controller
                .acquire_migration_dest(self.self_lp, mem_hint_bytes)
                .await?;
            let dest_ip = self.controller.lookup_node(dest_lp).await?;
            info!(dest_lp, %dest_ip, "acquired migration destination");

            // 2. reserve connections ahead of the transfer
            self.rpc.reserve_conns(dest_ip).await?;

            // 3. quiesce: block new local admissions and drain in-flight ones
            self.table.begin_migration(id)?;
            self.table.quiesce(id);

            // 4. mark migrating threads: handled by the proclet object's own
            // thread bookkeeping before `serialize` is invoked; by this point
            // every thread belonging to `id` must have reached a
            // migration-safe suspension point.
            let state = match serialize() {
                Ok(state) => state,
                Err(e) => {
                    self.table.status().set_status(id, crate::proclet::status::Status::Present);
                    self.controller.release_migration_dest(dest_lp).await.ok();
                    return Err(e);
                }
            };

            // 5. transmit heap+thread+sync state
            let payload = MigrationPayload {
                id,
                type_tag: type_tag.to_string(),
                state,
            };
            let req = wire::encode(&MigrationMsg::Transfer(payload))?;
            let (_ty, reply_bytes) = self
                .rpc
                .call(dest_ip, 0, RpcType::MigrationTransfer, &req)
                .await?;
            let reply: MigrationMsg = wire::decode(reply_bytes.as_slice())?;
            match reply {
                MigrationMsg::Ack { ok: true, .. } => {}
                MigrationMsg::Ack { ok: false, error } => {
                    self.table
                        .status()
                        .set_status(id, crate::proclet::status::Status::Present);
                    self.controller.release_migration_dest(dest_lp).await.ok();
                    return Err(rtanyhow!(
                        ERR_MIGRATION_ABORTED,
                        "destination rejected migration of {}: {:?}",
                        id,
                        error
                    ));
                }
                _ => {
                    self.controller.release_migration_dest(dest_lp).await.ok();
                    return Err(rtanyhow!(
                        ERR_INTERNAL,
                        "unexpected reply to migration transfer of {}",
                        id
                    ))
                }
            }

            // 6. install forwarding on the source so any in-flight call that
            // still lands here gets redirected rather than rejected.
            self.forward.install(id, dest_ip).await;

            // (destination resumes the proclet on its own, step 7, before
            // acking above — see `Migrator::accept_transfer`)

            // 8. update the controller's directory and invalidate local
            // caches so future resolutions skip the source entirely.
            self.controller.update_directory(id, dest_ip).await?;
            self.table.status().invalidate_cache(id);

            // 9. release source-side bookkeeping now that the destination
            // has confirmed it owns the proclet.
            self.table.status().clear(id);
            self.forward.clear(id).await;
            self.controller.release_migration_dest(dest_lp).await?;

            Ok(dest_ip)
        }
        .instrument(span)
        .await
    }

    /// Destination-side half of step 5-7: accepts a transferred proclet,
    /// lets `restore` reconstruct the live object from the transmitted
    /// bytes, installs it as `Present`, then acks.
    pub fn restore(
        &self,
        payload: MigrationPayload,
        restore: impl FnOnce(&[u8]) -> anyhow::Result<Box<dyn crate::proclet::ProcletObject>>,
    ) -> MigrationMsg {
        match restore(&payload.state) {
            Ok(object) => {
                self.table.install(payload.id, object);
                MigrationMsg::Ack {
                    id: payload.id,
                    ok: true,
                    error: None,
                }
            }
            Err(e) => MigrationMsg::Ack {
                id: payload.id,
                ok: false,
                error: Some(format!("{:#}", e)),
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn forward_table_roundtrip() {
        let table = ForwardTable::new();
        let id = ProcletId(0x8000_0000);
        assert_eq!(table.resolve(id).await, None);
        let dest = NodeIp(std::net::Ipv4Addr::new(10, 0, 0, 9));
        table.install(id, dest).await;
        assert_eq!(table.resolve(id).await, Some(dest));
        table.clear(id).await;
        assert_eq!(table.resolve(id).await, None);
    }
}
