//! Pointer registry.
//!
//! Maps opaque pointers to dense per-domain integer ids so dispatch-by-type
//! can index compact tables instead of hashing raw addresses. A domain is a
//! program-lifetime string compared by *pointer identity*; released ids are
//! recycled lowest-first to keep the id range dense.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use snafu::ensure;
use tracing::{debug, warn};

use crate::error::{AlreadyRegisteredSnafu, NotRegisteredSnafu, Result, UnknownRegistryEntrySnafu};

#[derive(Debug, Default)]
struct Domain {
    name: &'static str,
    /// Compact id `i` maps to `entries[i - 1]`; `0` marks a released slot.
    entries: Vec<usize>,
    /// Released ids, smallest first.
    free: BinaryHeap<Reverse<u32>>,
}

#[derive(Debug, Default)]
pub struct Registry {
    /// Keyed by the address of the domain string.
    domains: HashMap<usize, Domain>,
    /// Pointer → (domain address, id).
    by_ptr: HashMap<usize, (usize, u32)>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `addr` under `domain` and return its compact id (>= 1).
    /// The null pointer maps to id 0. A pointer may be registered in at most
    /// one domain.
    pub fn put(&mut self, domain: &'static str, addr: usize) -> Result<u32> {
        if addr == 0 {
            return Ok(0);
        }
        ensure!(!self.by_ptr.contains_key(&addr), AlreadyRegisteredSnafu { addr });

        let domain_key = domain.as_ptr() as usize;
        let entry = self.domains.entry(domain_key).or_insert_with(|| Domain { name: domain, ..Default::default() });

        let id = match entry.free.pop() {
            Some(Reverse(id)) => {
                entry.entries[id as usize - 1] = addr;
                id
            }
            None => {
                entry.entries.push(addr);
                entry.entries.len() as u32
            }
        };
        self.by_ptr.insert(addr, (domain_key, id));
        debug!(domain, id, addr = format_args!("{addr:#x}"), "registry_put");
        Ok(id)
    }

    /// Release a pointer's id back to its domain. The null pointer is a
    /// no-op.
    pub fn remove(&mut self, addr: usize) -> Result<()> {
        if addr == 0 {
            return Ok(());
        }
        let (domain_key, id) = self.by_ptr.remove(&addr).ok_or_else(|| NotRegisteredSnafu { addr }.build())?;
        let domain = self.domains.get_mut(&domain_key).expect("domain of a registered pointer");
        domain.entries[id as usize - 1] = 0;
        domain.free.push(Reverse(id));
        debug!(domain = domain.name, id, "registry_remove");
        Ok(())
    }

    pub fn get_id(&self, addr: usize) -> Result<u32> {
        if addr == 0 {
            return Ok(0);
        }
        self.by_ptr.get(&addr).map(|&(_, id)| id).ok_or_else(|| NotRegisteredSnafu { addr }.build())
    }

    pub fn get_domain(&self, addr: usize) -> Result<&'static str> {
        let &(domain_key, _) = self.by_ptr.get(&addr).ok_or_else(|| NotRegisteredSnafu { addr }.build())?;
        Ok(self.domains[&domain_key].name)
    }

    /// Pointer registered under `(domain, id)`; id 0 is the null pointer.
    pub fn get_ptr(&self, domain: &'static str, id: u32) -> Result<usize> {
        if id == 0 {
            return Ok(0);
        }
        let entry = self
            .domains
            .get(&(domain.as_ptr() as usize))
            .and_then(|d| d.entries.get(id as usize - 1).copied())
            .filter(|&addr| addr != 0);
        entry.ok_or_else(|| UnknownRegistryEntrySnafu { domain: domain.to_string(), id }.build())
    }

    /// Upper bound (inclusive) on the ids handed out for `domain`.
    pub fn get_max(&self, domain: &'static str) -> u32 {
        self.domains.get(&(domain.as_ptr() as usize)).map_or(0, |d| d.entries.len() as u32)
    }

    /// Truncate trailing released slots from every domain.
    pub fn trim(&mut self) {
        for domain in self.domains.values_mut() {
            let mut len = domain.entries.len();
            while len > 0 && domain.entries[len - 1] == 0 {
                len -= 1;
            }
            if len == domain.entries.len() {
                continue;
            }
            domain.entries.truncate(len);
            let keep: Vec<_> = domain.free.drain().filter(|&Reverse(id)| id as usize <= len).collect();
            domain.free.extend(keep);
        }
    }

    /// Number of registered pointers.
    pub fn len(&self) -> usize {
        self.by_ptr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ptr.is_empty()
    }

    /// Drop all registry state, warning about pointers never removed.
    pub fn shutdown(&mut self) {
        if !self.by_ptr.is_empty() {
            warn!(leaked = self.by_ptr.len(), "registry still holds pointers at shutdown");
        }
        self.domains.clear();
        self.by_ptr.clear();
    }
}
