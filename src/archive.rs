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
//! Component J: archive pool. Grounded on `inc/utils/archive_pool.hpp`
//! (`CachedPool`): reusable `Vec<u8>` buffers for serializing RPC payloads
//! and migration transfers, cached per-core the same way the slab
//! allocator's freelists are (SPEC_FULL B.5), rather than a single
//! contended global pool.
use parking_lot::Mutex;

pub const DEFAULT_CACHE_SIZE: usize = 4;

struct CoreCache {
    buffers: Mutex<Vec<Vec<u8>>>,
}

/// An archive buffer checked out from a `Pool`. Returned to its core's cache
/// on drop instead of being freed, unless the cache is already full.
pub struct Checkout<'a> {
    pool: &'a Pool,
    core: usize,
    buf: Option<Vec<u8>>,
}

impl Checkout<'_> {
    pub fn buf(&mut self) -> &mut Vec<u8> {
        self.buf.as_mut().expect("buf taken only by Drop")
    }
}

impl Drop for Checkout<'_> {
    fn drop(&mut self) {
        if let Some(mut buf) = self.buf.take() {
            buf.clear();
            let cache = &self.pool.cores[self.core % self.pool.cores.len()];
            let mut buffers = cache.buffers.lock();
            if buffers.len() < self.pool.cache_size {
                buffers.push(buf);
            }
        }
    }
}

/// One archive pool per node, with `cores` independent caches so concurrent
/// serialization on different cores never contends on a shared lock.
pub struct Pool {
    cores: Vec<CoreCache>,
    cache_size: usize,
}

impl Pool {
    pub fn new(cores: usize, cache_size: usize) -> Pool {
        Pool {
            cores: (0..cores.max(1))
                .map(|_| CoreCache {
                    buffers: Mutex::new(Vec::new()),
                })
                .collect(),
            cache_size,
        }
    }

    pub fn checkout(&self, core: usize) -> Checkout<'_> {
        let idx = core % self.cores.len();
        let buf = self.cores[idx].buffers.lock().pop().unwrap_or_default();
        Checkout {
            pool: self,
            core: idx,
            buf: Some(buf),
        }
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new(1, DEFAULT_CACHE_SIZE)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn checked_out_buffer_is_cleared_on_reuse() {
        let pool = Pool::new(2, DEFAULT_CACHE_SIZE);
        {
            let mut c = pool.checkout(0);
            c.buf().extend_from_slice(b"hello");
        }
        let c2 = pool.checkout(0);
        assert!(c2.buf.as_ref().unwrap().is_empty());
    }

    #[test]
    fn cache_caps_at_configured_size() {
        let pool = Pool::new(1, 1);
        let c1 = pool.checkout(0);
        let c2 = pool.checkout(0);
        drop(c1);
        drop(c2);
        // Both returned, but only one slot is kept; the pool should not
        // panic or grow unbounded.
        let c3 = pool.checkout(0);
        drop(c3);
    }
}
