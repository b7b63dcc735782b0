// This module resolves the base object of derived (interior) pointers. A pointer node whose
// type carries a non-zero offset into an object is derived; everything else is its own base.
// A constant derived pointer is null plus an offset and takes the canonical null constant as
// its base. An address node takes its base input. A phi of derived pointers takes the merge of
// its inputs' bases: when all of them agree no merge is needed, otherwise a base phi is
// synthesized in the phi's block, unless an existing phi of that block already merges exactly
// those bases (distinct null constants count as equal). Results are memoized. Phis that are
// still being resolved answer as pending; a phi's own pending self-reference is ignored when
// deciding whether bases agree and becomes the new base phi itself, while a pending reference
// to another phi of the same cycle is patched once that phi has been resolved.

//! Derived-pointer base resolution.

use bumpalo::{collections::Vec as BumpVec, Bump};
use hashbrown::{DefaultHashBuilder, HashMap};
use log::trace;

use crate::core::adaptor::CfgWalker;
use crate::core::error::{CompileError, CompileResult};
use crate::core::session::CompilationSession;
use crate::graph::{slots, BasicType, Graph, Node, NodeId, NodeKind, NodeType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemoEntry {
    InProgress,
    Resolved(NodeId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Base {
    Known(NodeId),
    /// Base of a phi still on the resolution stack.
    Pending(NodeId),
}

/// Base phi input waiting for a pending phi to resolve.
#[derive(Debug, Clone, Copy)]
struct Fixup {
    phi: NodeId,
    index: usize,
    waiting_on: NodeId,
}

/// Memoized derived-base resolution for one unit.
pub struct DerivedBases<'arena> {
    memo: HashMap<NodeId, MemoEntry, DefaultHashBuilder, &'arena Bump>,
    fixups: BumpVec<'arena, Fixup>,
}

/// Pointer into the middle of an object.
pub fn is_derived(ty: &NodeType) -> bool {
    ty.basic == BasicType::Object && ty.offset != 0
}

impl<'arena> DerivedBases<'arena> {
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            memo: HashMap::new_in(arena),
            fixups: BumpVec::new_in(arena),
        }
    }

    /// Base node of `derived`; non-derived nodes are their own base.
    pub fn find_derived_base(
        &mut self,
        graph: &mut Graph,
        derived: NodeId,
        session: &CompilationSession<'_>,
    ) -> CompileResult<NodeId> {
        match self.find(graph, derived, session)? {
            Base::Known(base) => Ok(base),
            // Only phis on the resolution stack are pending, and the stack is empty here.
            Base::Pending(phi) => Err(CompileError::MalformedNode {
                node: phi,
                reason: "unresolved derived base".to_string(),
            }),
        }
    }

    fn resolve(&mut self, derived: NodeId, base: NodeId) -> Base {
        self.memo.insert(derived, MemoEntry::Resolved(base));
        Base::Known(base)
    }

    fn find(
        &mut self,
        graph: &mut Graph,
        derived: NodeId,
        session: &CompilationSession<'_>,
    ) -> CompileResult<Base> {
        match self.memo.get(&derived) {
            Some(MemoEntry::Resolved(base)) => return Ok(Base::Known(*base)),
            Some(MemoEntry::InProgress) => return Ok(Base::Pending(derived)),
            None => {}
        }

        let node = graph.node(derived);
        if !is_derived(&node.ty) {
            return Ok(self.resolve(derived, derived));
        }

        // Null plus offset.
        if node.kind.is_con() {
            let base = graph.mach_null();
            return Ok(self.resolve(derived, base));
        }

        if !node.kind.is_phi() {
            if !matches!(node.kind, NodeKind::AddP { .. }) {
                return Err(CompileError::MalformedNode {
                    node: derived,
                    reason: format!("derived pointer from {}", node.kind.name()),
                });
            }
            let input = node.input(slots::BASE).ok_or(CompileError::MissingInput {
                node: derived,
                index: slots::BASE,
            })?;
            let base = match self.find(graph, input, session)? {
                Base::Known(base) => base,
                Base::Pending(phi) => {
                    return Err(CompileError::MalformedNode {
                        node: phi,
                        reason: "address base depends on its own derived pointer".to_string(),
                    })
                }
            };
            return Ok(self.resolve(derived, base));
        }

        self.find_phi_base(graph, derived, session)
    }

    fn find_phi_base(
        &mut self,
        graph: &mut Graph,
        derived: NodeId,
        session: &CompilationSession<'_>,
    ) -> CompileResult<Base> {
        self.memo.insert(derived, MemoEntry::InProgress);

        let node = graph.node(derived).clone();
        let mut bases = Vec::with_capacity(node.req().saturating_sub(1));
        for i in 1..node.req() {
            let input = node.input(i).ok_or(CompileError::MissingInput {
                node: derived,
                index: i,
            })?;
            bases.push(self.find(graph, input, session)?);
        }

        // See if the inputs agree on a base, ignoring the phi's own back edges.
        let mut agreed: Option<NodeId> = None;
        let mut need_phi = false;
        for base in &bases {
            match *base {
                Base::Pending(phi) if phi == derived => {}
                Base::Pending(_) => need_phi = true,
                Base::Known(b) => match agreed {
                    None => agreed = Some(b),
                    Some(a) if a != b => need_phi = true,
                    Some(_) => {}
                },
            }
        }
        if !need_phi {
            if let Some(base) = agreed {
                let resolved = self.resolve(derived, base);
                self.apply_fixups(graph, derived, base);
                return Ok(resolved);
            }
        }

        let block = graph.block_for_node(derived).ok_or_else(|| CompileError::BlockLayout {
            block: None,
            reason: format!("phi {derived} is not scheduled"),
        })?;
        let new_id = NodeId(graph.node_count() as u32);
        let mut inputs = vec![node.input(0)];
        let mut waiting = Vec::new();
        for (i, base) in bases.iter().enumerate() {
            inputs.push(match *base {
                Base::Known(b) => Some(b),
                Base::Pending(phi) if phi == derived => Some(new_id),
                Base::Pending(phi) => {
                    waiting.push((i + 1, phi));
                    None
                }
            });
        }

        // Reuse an existing base phi of the block when one merges the same bases.
        let mut pos = 1;
        let mut existing = None;
        let block_nodes = graph.block(block).nodes.clone();
        while pos < block_nodes.len() {
            let candidate = block_nodes[pos];
            if !graph.node(candidate).kind.is_phi() {
                break;
            }
            if waiting.is_empty() && self.same_bases(graph, candidate, new_id, &inputs) {
                existing = Some(candidate);
                break;
            }
            pos += 1;
        }

        let base = match existing {
            Some(phi) => phi,
            None => {
                let id = graph.insert_node(
                    block,
                    pos,
                    Node::new(NodeKind::Phi, NodeType::of(BasicType::Object), inputs),
                );
                session.record_base_phi();
                trace!("created base phi {id} for {derived} in {block}");
                for (index, phi) in waiting {
                    self.fixups.push(Fixup {
                        phi: id,
                        index,
                        waiting_on: phi,
                    });
                }
                id
            }
        };

        let resolved = self.resolve(derived, base);
        self.apply_fixups(graph, derived, base);
        Ok(resolved)
    }

    fn same_bases(&self, graph: &Graph, phi: NodeId, new_id: NodeId, inputs: &[Option<NodeId>]) -> bool {
        let existing = graph.node(phi);
        if existing.req() != inputs.len() {
            return false;
        }
        (1..inputs.len()).all(|j| {
            let (have, want) = (existing.input(j), inputs[j]);
            // A self-reference of the new phi matches a self-reference of the candidate.
            let want = if want == Some(new_id) { Some(phi) } else { want };
            if have == want {
                return true;
            }
            match (have, want) {
                (Some(a), Some(b)) => graph.node(a).kind.is_con() && graph.node(b).kind.is_con(),
                _ => false,
            }
        })
    }

    fn apply_fixups(&mut self, graph: &mut Graph, resolved: NodeId, base: NodeId) {
        let mut i = 0;
        while i < self.fixups.len() {
            let fixup = self.fixups[i];
            if fixup.waiting_on == resolved {
                graph.set_input(fixup.phi, fixup.index, Some(base));
                self.fixups.swap_remove(i);
            } else {
                i += 1;
            }
        }
    }

    /// Number of memoized nodes.
    pub fn memoized(&self) -> usize {
        self.memo.len()
    }
}
