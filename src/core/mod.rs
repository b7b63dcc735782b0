// This module is the central hub for the infrastructure shared by the selector and the
// relocator. It exports and organizes key subsystems: session management (arena-based scratch
// allocation and compilation statistics), host configuration (word size, parameter quota,
// pointer compression, thread layout), the value cache that memoizes node lowering, the CFG
// walker trait used to traverse the scheduled graph, and the error taxonomy shared by every
// pass. Nothing in here knows about particular node kinds or relocation shapes.

//! Core infrastructure
//!
//! # Key Components
//!
//! ## Session Management (`session`)
//! - Arena-based scratch allocation using `bumpalo`
//! - Compilation statistics
//!
//! ## Configuration (`config`)
//! - Host runtime parameters threaded into the selector
//! - Oop and klass compression encoding
//!
//! ## Value Cache (`value_cache`)
//! - Lower-once memoization keyed by node id
//!
//! ## CFG Walker (`adaptor`)
//! - Ordered traversal of blocks and scheduled nodes
//! - Connector block skipping

pub mod adaptor;
pub mod config;
pub mod error;
pub mod session;
pub mod test_utils;
pub mod value_cache;

// Re-export core components
pub use session::{CompilationSession, SessionStats};

pub use config::{Compression, SelectorConfig, ThreadLayout};

pub use error::{CompileError, CompileResult};

pub use value_cache::{Lowered, ValueCache};

pub use adaptor::CfgWalker;
