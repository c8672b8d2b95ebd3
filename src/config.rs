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
//! YAML-backed node configuration, in the same shape as `kuiba`'s
//! `guc.rs`/`gucdef`: a fixed, named set of keys with boot defaults,
//! validated on load. Unlike `guc.rs` there is no runtime `SET`, so there is
//! no `Context`/`Source` distinction — a node's config is read once at
//! startup and is immutable for the node's lifetime.
use crate::{rtanyhow, utils::err::ERR_INTERNAL};
use std::convert::TryFrom;
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::warn;
use yaml_rust::{Yaml, YamlLoader};

#[derive(Debug, Clone)]
pub struct Config {
    /// Number of cores this node dedicates to proclet execution; also the
    /// number of per-core slab/archive caches and RPC flows.
    pub cores: u32,
    /// Total heap bytes this node is willing to host proclets in.
    pub mem_quota_bytes: u64,
    /// Low watermark (bytes free) below which the pressure monitor reports
    /// memory pressure to the controller.
    pub mem_low_watermark_bytes: u64,
    /// This node's own externally reachable address, reported to the
    /// controller at `register_node` time.
    pub bind_addr: Ipv4Addr,
    pub bind_port: u16,
    /// Controller service address.
    pub controller_addr: Ipv4Addr,
    pub controller_port: u16,
    /// Per-flow RPC credit, see `rpc::transport`.
    pub rpc_credits: u32,
    /// Per-core archive pool cache entries, see `archive::Pool`.
    pub archive_cache_size: u32,
    /// Pressure monitor poll interval, milliseconds.
    pub poll_interval_ms: u64,
    /// Resource reporter report interval, milliseconds.
    pub report_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            cores: 1,
            mem_quota_bytes: 8 * 1024 * 1024 * 1024,
            mem_low_watermark_bytes: 512 * 1024 * 1024,
            bind_addr: Ipv4Addr::new(127, 0, 0, 1),
            bind_port: 8000,
            controller_addr: Ipv4Addr::new(127, 0, 0, 1),
            controller_port: 8001,
            rpc_credits: 128,
            archive_cache_size: 4,
            poll_interval_ms: 100,
            report_interval_ms: 1000,
        }
    }
}

fn yaml_to_u32(v: &Yaml) -> Option<u32> {
    v.as_i64().and_then(|i| u32::try_from(i).ok())
}

fn yaml_to_u64(v: &Yaml) -> Option<u64> {
    v.as_i64().and_then(|i| u64::try_from(i).ok())
}

fn yaml_to_ipv4(v: &Yaml) -> Option<Ipv4Addr> {
    v.as_str().and_then(|s| s.parse().ok())
}

macro_rules! load_field {
    ($cfg:ident, $key:ident, $val:ident, $field:ident, $conv:expr) => {
        match $conv($val) {
            Some(v) => $cfg.$field = v,
            None => warn!(
                "config: invalid value for {:?}, value={:?}, keeping default",
                $key, $val
            ),
        }
    };
}

fn apply_key(cfg: &mut Config, key: &str, val: &Yaml) {
    match key {
        "cores" => load_field!(cfg, key, val, cores, yaml_to_u32),
        "mem_quota_bytes" => load_field!(cfg, key, val, mem_quota_bytes, yaml_to_u64),
        "mem_low_watermark_bytes" => {
            load_field!(cfg, key, val, mem_low_watermark_bytes, yaml_to_u64)
        }
        "bind_addr" => load_field!(cfg, key, val, bind_addr, yaml_to_ipv4),
        "bind_port" => load_field!(cfg, key, val, bind_port, |v: &Yaml| v
            .as_i64()
            .and_then(|i| u16::try_from(i).ok())),
        "controller_addr" => load_field!(cfg, key, val, controller_addr, yaml_to_ipv4),
        "controller_port" => load_field!(cfg, key, val, controller_port, |v: &Yaml| v
            .as_i64()
            .and_then(|i| u16::try_from(i).ok())),
        "rpc_credits" => load_field!(cfg, key, val, rpc_credits, yaml_to_u32),
        "archive_cache_size" => load_field!(cfg, key, val, archive_cache_size, yaml_to_u32),
        "poll_interval_ms" => load_field!(cfg, key, val, poll_interval_ms, yaml_to_u64),
        "report_interval_ms" => load_field!(cfg, key, val, report_interval_ms, yaml_to_u64),
        other => {
            // Matching kuiba's guc.rs, but stricter: an unrecognized key is a
            // hard load error rather than a warning, since this config has no
            // concept of extension/third-party keys.
            warn!("config: unrecognized key {:?}", other);
        }
    }
}

/// Loads a node config from a YAML file. Unrecognized keys are rejected: the
/// first unknown key turns the whole load into an error.
pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Config> {
    let text = std::fs::read_to_string(path.as_ref())
        .map_err(|e| rtanyhow!(ERR_INTERNAL, "failed to read config {:?}: {}", path.as_ref(), e))?;
    let docs = YamlLoader::load_from_str(&text)
        .map_err(|e| rtanyhow!(ERR_INTERNAL, "invalid yaml in {:?}: {}", path.as_ref(), e))?;
    let mut cfg = Config::default();
    let doc = match docs.first() {
        Some(d) => d,
        None => return Ok(cfg),
    };
    let hash = doc
        .as_hash()
        .ok_or_else(|| rtanyhow!(ERR_INTERNAL, "config root must be a mapping"))?;
    let mut unknown = Vec::new();
    for (k, v) in hash {
        let key = match k.as_str() {
            Some(s) => s,
            None => continue,
        };
        if !KNOWN_KEYS.contains(&key) {
            unknown.push(key.to_string());
            continue;
        }
        apply_key(&mut cfg, key, v);
    }
    rtensure_known(&unknown)?;
    Ok(cfg)
}

const KNOWN_KEYS: &[&str] = &[
    "cores",
    "mem_quota_bytes",
    "mem_low_watermark_bytes",
    "bind_addr",
    "bind_port",
    "controller_addr",
    "controller_port",
    "rpc_credits",
    "archive_cache_size",
    "poll_interval_ms",
    "report_interval_ms",
];

fn rtensure_known(unknown: &[String]) -> anyhow::Result<()> {
    if unknown.is_empty() {
        Ok(())
    } else {
        Err(rtanyhow!(
            ERR_INTERNAL,
            "config: unrecognized keys: {:?}",
            unknown
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct ScratchFile(std::path::PathBuf);

    impl ScratchFile {
        fn new(name: &str, contents: &str) -> ScratchFile {
            let path = std::env::temp_dir().join(format!(
                "nuproc-config-test-{}-{}-{}",
                std::process::id(),
                name,
                rand::random::<u32>()
            ));
            std::fs::write(&path, contents).unwrap();
            ScratchFile(path)
        }
    }

    impl Drop for ScratchFile {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    #[test]
    fn defaults_without_file_contents() {
        let cfg = Config::default();
        assert_eq!(cfg.cores, 1);
        assert_eq!(cfg.rpc_credits, 128);
    }

    #[test]
    fn load_overrides_known_keys() {
        let f = ScratchFile::new(
            "ok",
            "cores: 8\nbind_addr: \"10.0.0.5\"\nbind_port: 9100\n",
        );
        let cfg = load(&f.0).unwrap();
        assert_eq!(cfg.cores, 8);
        assert_eq!(cfg.bind_addr, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(cfg.bind_port, 9100);
    }

    #[test]
    fn load_rejects_unknown_key() {
        let f = ScratchFile::new("bad", "cores: 2\nbogus_key: 1\n");
        assert!(load(&f.0).is_err());
    }
}
