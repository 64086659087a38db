//! Port allocation decisions over a config snapshot

use crate::entry::ProxyEntry;
use std::collections::HashSet;

/// What to do with a requested `(port, url)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDecision {
    /// The management port was requested.
    Reserved,
    /// An entry already maps this port to the same url.
    ExactMatch,
    /// Another url owns the port; `recommended` is the replacement, if any
    /// port is left.
    Conflict { recommended: Option<u16> },
    Available,
}

/// Pure allocation logic. Callers hold the orchestration lock between
/// deciding and binding.
#[derive(Debug, Clone, Copy)]
pub struct PortAllocator {
    management_port: u16,
    base_port: u16,
}

impl PortAllocator {
    pub fn new(management_port: u16, base_port: u16) -> Self {
        Self {
            management_port,
            base_port,
        }
    }

    pub fn management_port(&self) -> u16 {
        self.management_port
    }

    pub fn check(&self, entries: &[ProxyEntry], port: u16, url: &str) -> PortDecision {
        if port == self.management_port {
            return PortDecision::Reserved;
        }

        match entries.iter().find(|e| e.proxy_port == port) {
            None => PortDecision::Available,
            Some(entry) if entry.url == url => PortDecision::ExactMatch,
            Some(_) => PortDecision::Conflict {
                recommended: self.recommend_port(entries),
            },
        }
    }

    /// First port at or above the base port that is neither used by an
    /// entry nor the management port.
    pub fn recommend_port(&self, entries: &[ProxyEntry]) -> Option<u16> {
        let used: HashSet<u16> = entries.iter().map(|e| e.proxy_port).collect();
        (self.base_port..=u16::MAX).find(|p| *p != self.management_port && !used.contains(p))
    }
}
