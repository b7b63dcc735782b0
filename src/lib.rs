//! machsel - machine-graph selection and relocation for a method JIT.
//!
//! The crate is the back end between the optimizer and an installed
//! method. It lowers the scheduled machine-node graph of one compilation
//! unit into a statepoint-aware SSA target function, records pointer
//! provenance and call-site stack map data for a precise collector, and
//! patches the emitted code buffer once its layout is final.
//!
//! # Primary Usage
//!
//! ```ignore
//! use bumpalo::Bump;
//! use machsel::core::{CompilationSession, SelectorConfig};
//! use machsel::selector::Selector;
//!
//! let arena = Bump::new();
//! let session = CompilationSession::new(&arena);
//! let config = SelectorConfig::default();
//!
//! let selection = Selector::new(&mut graph, &config, &session)?.run()?;
//! // ... emit code for selection.function, then:
//! let mut relocator = machsel::reloc::Relocator::new();
//! for (site, offset) in placed_sites {
//!     relocator.add_site(site, offset)?;
//! }
//! relocator.apply(&mut code_buffer, &session)?;
//! ```
//!
//! # Architecture
//!
//! - [`graph`] - Scheduled machine-node graph handed over by the optimizer
//! - [`target`] - Target SSA representation, builder and reference interpreter
//! - [`selector`] - Node lowering, calling convention, provenance, derived bases
//! - [`reloc`] - Deferred code buffer patching
//! - [`core`] - Shared infrastructure (session, configuration, errors, value cache)

pub mod core;
pub mod debug_info;
pub mod graph;
pub mod reloc;
pub mod selector;
pub mod target;

pub use core::{CompilationSession, CompileError, CompileResult, SelectorConfig, SessionStats};
pub use graph::{Graph, GraphBuilder};
pub use reloc::{CodeBuffer, Relocator};
pub use selector::{Selection, Selector};
pub use target::Function;
