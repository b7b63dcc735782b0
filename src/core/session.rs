// This module provides arena-based compilation session management using the bumpalo crate.
// CompilationSession owns a reference to the arena that backs the derived-base memo and collects
// SessionStats for one compilation unit: how many nodes were lowered, phis resolved, call
// sites and landing pads created, dispatch blocks synthesized, base phis inserted, and how
// many relocations and constants the relocator applied. Statistics live behind a RefCell so
// the selector and relocator can record progress through a shared reference.

//! Arena-based compilation session management.
//!
//! All scratch data of a selection pass is tied to the session lifetime,
//! which keeps lifetimes simple for the selector's internal maps.

use bumpalo::Bump;
use std::cell::RefCell;
use std::fmt;

/// Arena-based compilation session.
pub struct CompilationSession<'arena> {
    /// Arena allocator for pass-local objects.
    arena: &'arena Bump,

    /// Session statistics for debugging and tests.
    stats: RefCell<SessionStats>,

    /// Compilation unit being processed.
    current_unit: RefCell<Option<String>>,
}

impl<'arena> CompilationSession<'arena> {
    /// Create a new compilation session with the given arena.
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(SessionStats::default()),
            current_unit: RefCell::new(None),
        }
    }

    /// Get access to the arena allocator.
    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    pub fn set_current_unit(&self, name: &str) {
        *self.current_unit.borrow_mut() = Some(name.to_string());
    }

    pub fn current_unit(&self) -> Option<String> {
        self.current_unit.borrow().clone()
    }

    pub fn record_node_lowered(&self) {
        self.stats.borrow_mut().nodes_lowered += 1;
    }

    pub fn record_phi_resolved(&self) {
        self.stats.borrow_mut().phi_nodes_resolved += 1;
    }

    pub fn record_call_site(&self) {
        self.stats.borrow_mut().call_sites += 1;
    }

    pub fn record_landing_pad(&self) {
        self.stats.borrow_mut().landing_pads += 1;
    }

    pub fn record_dispatch_block(&self) {
        self.stats.borrow_mut().dispatch_blocks += 1;
    }

    pub fn record_base_phi(&self) {
        self.stats.borrow_mut().base_phis_created += 1;
    }

    pub fn record_relocation_applied(&self) {
        self.stats.borrow_mut().relocations_applied += 1;
    }

    pub fn record_constant_materialized(&self) {
        self.stats.borrow_mut().constants_materialized += 1;
    }

    /// Get compilation statistics.
    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Compilation session statistics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionStats {
    /// Nodes whose lowering actually ran (cache misses).
    pub nodes_lowered: usize,

    /// Phi inputs attached during merge resolution.
    pub phi_nodes_resolved: usize,

    pub call_sites: usize,

    pub landing_pads: usize,

    /// Synthetic blocks of chained handler comparisons.
    pub dispatch_blocks: usize,

    /// Base phis inserted by derived-base resolution.
    pub base_phis_created: usize,

    pub relocations_applied: usize,

    pub constants_materialized: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compilation Statistics:")?;
        writeln!(f, "  Nodes lowered: {}", self.nodes_lowered)?;
        writeln!(f, "  Phi inputs resolved: {}", self.phi_nodes_resolved)?;
        writeln!(f, "  Call sites: {}", self.call_sites)?;
        writeln!(f, "  Landing pads: {}", self.landing_pads)?;
        writeln!(f, "  Dispatch blocks: {}", self.dispatch_blocks)?;
        writeln!(f, "  Base phis created: {}", self.base_phis_created)?;
        writeln!(f, "  Relocations applied: {}", self.relocations_applied)?;
        write!(f, "  Constants materialized: {}", self.constants_materialized)
    }
}
