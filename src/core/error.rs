// This module defines the error taxonomy of the selector and relocator using the thiserror
// crate. Every variant is an internal-consistency failure: a malformed or unsupported input
// graph, a node/operand/condition combination outside the recognized set, conflicting pointer
// provenance, a broken block layout, or a relocation that cannot be applied to the emitted
// code buffer. None of them is recoverable: the first error aborts compilation of the current
// unit and the enclosing VM is expected to fall back to a safe execution mode for it.
// CompileResult<T> is the Result alias used throughout the crate.

//! Error types for machine-graph selection and relocation.
//!
//! Using thiserror for more idiomatic error handling.

use thiserror::Error;

use crate::graph::{BasicType, BlockId, CmpKind, CondCode, NodeId};
use crate::selector::provenance::PtrTag;
use crate::target::Value;

/// Main error type for a compilation unit.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("Unsupported basic type {ty:?} in {context}")]
    UnsupportedType {
        ty: BasicType,
        context: &'static str,
    },

    #[error("Unsupported condition {cond:?} for {cmp:?} comparison")]
    UnsupportedCondition {
        cond: CondCode,
        cmp: CmpKind,
    },

    #[error("Malformed node {node}: {reason}")]
    MalformedNode {
        node: NodeId,
        reason: String,
    },

    #[error("Node {node} is missing input {index}")]
    MissingInput {
        node: NodeId,
        index: usize,
    },

    #[error("Value {value} already tagged {existing:?}, cannot tag {requested:?}")]
    ProvenanceConflict {
        value: Value,
        existing: PtrTag,
        requested: PtrTag,
    },

    #[error("Value {value} is not a managed pointer: {reason}")]
    UntaggedPointer {
        value: Value,
        reason: &'static str,
    },

    #[error("Block layout error in {block:?}: {reason}")]
    BlockLayout {
        block: Option<BlockId>,
        reason: String,
    },

    #[error("Phi input {value} cannot be cast to the phi representation: {reason}")]
    PhiRepresentation {
        value: Value,
        reason: String,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },

    #[error("Two relocations at code offset {offset:#x}")]
    DuplicateRelocation {
        offset: usize,
    },

    #[error("Unsupported relocation: {reason}")]
    UnsupportedRelocation {
        reason: String,
    },

    #[error("Cannot patch code offset {offset:#x}: {reason}")]
    InvalidPatchSite {
        offset: usize,
        reason: String,
    },
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;
