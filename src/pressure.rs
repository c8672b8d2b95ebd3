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
//! Component H: local pressure monitoring. Grounded on `inc/nu/monitor.hpp`
//! and `inc/nu/resource_reporter.hpp`, kept as two independent periodic
//! loops (SPEC_FULL B.7) rather than fused into one, since they run on
//! different timers (`T_poll` vs `T_report`) and react to different things
//! (local migration decisions vs. the controller's view of this node).
use crate::controller::client::ControllerClient;
use crate::sync::CpuLoad;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tracing::{info, warn};

/// A single resource snapshot, computed with the *same* formula the
/// controller's `FreeResource::observe` applies on its side (SPEC_FULL Open
/// Question C.2): free memory and CPU idle fraction.
#[derive(Debug, Clone, Copy)]
pub struct Resource {
    pub free_mem_bytes: u64,
    pub cpu_idle_frac: f64,
}

pub fn resource_usage(mem_quota_bytes: u64, live_bytes: u64, cpu_load: &CpuLoad) -> Resource {
    Resource {
        free_mem_bytes: mem_quota_bytes.saturating_sub(live_bytes),
        cpu_idle_frac: (1.0 - cpu_load.load()).max(0.0),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    CpuCongestion,
    MemoryLowWatermark,
}

/// Polls local resource usage on its own timer (`T_poll`) and emits a
/// `Trigger` whenever either independent threshold is crossed. CPU
/// congestion and the memory low watermark are checked separately
/// (SPEC_FULL B.4): a node can be CPU-congested while memory-healthy, or
/// vice versa, and each should be actionable on its own rather than waiting
/// for both.
pub struct Monitor {
    mem_quota_bytes: u64,
    mem_low_watermark_bytes: u64,
    cpu_congestion_threshold: f64,
    poll_interval: Duration,
}

impl Monitor {
    pub fn new(mem_quota_bytes: u64, mem_low_watermark_bytes: u64, poll_interval: Duration) -> Monitor {
        Monitor {
            mem_quota_bytes,
            mem_low_watermark_bytes,
            cpu_congestion_threshold: 0.05, // idle_frac below this counts as congested
            poll_interval,
        }
    }

    /// Runs until `live_bytes`/`cpu_load` are dropped, sending a `Trigger`
    /// each time a poll observes a crossed threshold (repeatedly, while the
    /// condition persists — callers debounce if they only want edges).
    pub async fn run(
        self,
        live_bytes: Arc<AtomicU64>,
        cpu_load: Arc<CpuLoad>,
        triggers: mpsc::UnboundedSender<Trigger>,
    ) {
        let mut ticker = interval(self.poll_interval);
        loop {
            ticker.tick().await;
            let usage = resource_usage(self.mem_quota_bytes, live_bytes.load(Ordering::Relaxed), &cpu_load);
            if usage.free_mem_bytes < self.mem_low_watermark_bytes {
                warn!(
                    free_mem_bytes = usage.free_mem_bytes,
                    watermark = self.mem_low_watermark_bytes,
                    "memory pressure below low watermark"
                );
                if triggers.send(Trigger::MemoryLowWatermark).is_err() {
                    return;
                }
            }
            if usage.cpu_idle_frac < self.cpu_congestion_threshold {
                warn!(cpu_idle_frac = usage.cpu_idle_frac, "cpu congestion detected");
                if triggers.send(Trigger::CpuCongestion).is_err() {
                    return;
                }
            }
        }
    }
}

/// Periodically pushes this node's resource snapshot to the controller, on
/// its own timer (`T_report`), independent of `Monitor`'s poll cadence.
pub struct ResourceReporter {
    lp: u32,
    mem_quota_bytes: u64,
    report_interval: Duration,
}

impl ResourceReporter {
    pub fn new(lp: u32, mem_quota_bytes: u64, report_interval: Duration) -> ResourceReporter {
        ResourceReporter {
            lp,
            mem_quota_bytes,
            report_interval,
        }
    }

    pub async fn run(
        self,
        live_bytes: Arc<AtomicU64>,
        cpu_load: Arc<CpuLoad>,
        client: Arc<ControllerClient>,
    ) {
        let mut ticker = interval(self.report_interval);
        loop {
            ticker.tick().await;
            let usage = resource_usage(self.mem_quota_bytes, live_bytes.load(Ordering::Relaxed), &cpu_load);
            if let Err(e) = client
                .report_resources(self.lp, usage.free_mem_bytes, usage.cpu_idle_frac)
                .await
            {
                warn!(err = %e, "failed to report resources to controller");
            } else {
                info!(
                    free_mem_bytes = usage.free_mem_bytes,
                    cpu_idle_frac = usage.cpu_idle_frac,
                    "reported resources"
                );
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn resource_usage_subtracts_live_bytes() {
        let load = CpuLoad::new();
        let usage = resource_usage(1000, 400, &load);
        assert_eq!(usage.free_mem_bytes, 600);
        assert_eq!(usage.cpu_idle_frac, 1.0);
    }

    #[test]
    fn resource_usage_saturates_at_zero() {
        let load = CpuLoad::new();
        let usage = resource_usage(100, 400, &load);
        assert_eq!(usage.free_mem_bytes, 0);
    }

    #[tokio::test]
    async fn monitor_fires_memory_trigger_below_watermark() {
        let monitor = Monitor::new(1000, 900, Duration::from_millis(5));
        let live = Arc::new(AtomicU64::new(200));
        let cpu = Arc::new(CpuLoad::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(monitor.run(live, cpu, tx));
        let trigger = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(trigger, Trigger::MemoryLowWatermark);
    }
}
