// This module implements the Selector, which lowers one scheduled machine-node graph into a
// target function. It creates one target block per source block plus a synthetic entry block
// that runs the prolog (frame address, thread pointer from the host TLS accessor, fixed frame
// allocation) and jumps to the root block's target. Blocks are then walked in layout order and
// every scheduled node is lowered through a closed match over its kind; results are memoized in
// the value cache so a node with many consumers is lowered exactly once and every consumer sees
// the same value. Nodes needed before their own block is walked (parameters, constants, phi
// inputs reached through back edges) are lowered on demand. Merges are lowered in two passes:
// an empty phi is created at the head of its block when the phi node is reached, and its
// inputs are attached after all blocks are done. Along the way the selector records pointer
// provenance tags for the collector, per-call-site descriptors (stack map id, deoptimization
// values, GC-live pointers, handler blocks), the relocation sites the code emitter must resolve
// (calls and inline constants) and the exception handler table. Submodules hold the address,
// branch, call, compressed-pointer and phi lowering; the calling convention, provenance table
// and derived-base resolver are self-contained.

//! Machine-node selection.
//!
//! ```text
//! Graph ──► Selector::run ──► Selection { function, provenance, call_sites, reloc_sites, .. }
//!                                │
//!                                └─► code emitter ──► Relocator
//! ```

use hashbrown::HashMap;
use log::{debug, error, trace};

use crate::core::adaptor::CfgWalker;
use crate::core::config::SelectorConfig;
use crate::core::error::{CompileError, CompileResult};
use crate::core::session::CompilationSession;
use crate::core::value_cache::{Lowered, ValueCache};
use crate::debug_info::{DebugInfo, StackMapId, StackMapKind};
use crate::graph::{
    BasicType, BinaryOp, BlockId, ConvOp, Graph, NodeId, NodeKind, NodeType, ThreadField,
};
use crate::reloc::RelocRequest;
use crate::target::{
    BinOp, BlockOrigin, BlockRef, CastOp, Function, FunctionBuilder, Op, Terminator, Type, Value,
};

mod address;
mod branch;
mod call;
pub mod callconv;
pub mod derived;
mod oops;
mod phi;
pub mod provenance;

pub use callconv::{pack, ParamLayout};
pub use derived::DerivedBases;
pub use provenance::{Provenance, PtrTag};

/// Descriptor of one lowered call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSite {
    /// Sequence number of the call within the unit.
    pub id: usize,
    pub node: NodeId,
    pub block: BlockId,
    pub stackmap: StackMapId,
    pub debug: DebugInfo,
    /// Lowered interpreter-state values.
    pub deopt: Vec<Value>,
    /// Pointers live across the call, bases of derived pointers included.
    pub gc_live: Vec<Value>,
    /// Normal continuation of an exception-covered call.
    pub normal: Option<BlockId>,
    pub handlers: Vec<BlockId>,
}

/// What a relocation site is anchored to in the emitted code.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RelocAnchor {
    /// The call instruction recorded under this stack map id.
    StackMap(StackMapId),
    /// The instruction materializing this constant.
    Constant(Value),
}

/// Relocation the code emitter turns into a `Relocator` record once it
/// knows the anchor's buffer offset.
#[derive(Debug, Clone, PartialEq)]
pub struct RelocSite {
    pub anchor: RelocAnchor,
    pub request: RelocRequest,
}

/// Output of a selection pass.
#[derive(Debug, Clone)]
pub struct Selection {
    pub function: Function,
    /// Target block of each source block.
    pub blocks: Vec<BlockRef>,
    pub param_layout: ParamLayout,
    pub provenance: Provenance,
    pub call_sites: Vec<CallSite>,
    pub reloc_sites: Vec<RelocSite>,
    /// Exception handler blocks per source block.
    pub handler_table: HashMap<BlockId, Vec<BlockId>>,
    pub frame_address: Option<Value>,
    pub thread: Option<Value>,
}

impl Selection {
    pub fn block(&self, block: BlockId) -> BlockRef {
        self.blocks[block.index()]
    }
}

/// Target type of a basic type. Narrow oops share the pointer
/// representation under fast compression.
pub fn basic_type(bt: BasicType, fast_compression: bool) -> CompileResult<Type> {
    Ok(match bt {
        BasicType::Boolean => Type::I1,
        BasicType::Byte => Type::I8,
        BasicType::Char | BasicType::Short => Type::I16,
        BasicType::Int | BasicType::NarrowKlass => Type::I32,
        BasicType::NarrowOop if fast_compression => Type::Ptr,
        BasicType::NarrowOop => Type::I32,
        BasicType::Long => Type::I64,
        BasicType::Float => Type::F32,
        BasicType::Double => Type::F64,
        BasicType::Object | BasicType::Metadata | BasicType::Address => Type::Ptr,
        BasicType::Void => Type::Void,
        BasicType::Half => {
            return Err(CompileError::UnsupportedType {
                ty: bt,
                context: "value type",
            })
        }
    })
}

pub struct Selector<'g, 'arena> {
    graph: &'g mut Graph,
    config: &'g SelectorConfig,
    session: &'g CompilationSession<'arena>,
    builder: FunctionBuilder,
    entry: BlockRef,
    blocks: Vec<BlockRef>,
    /// Source block being lowered.
    block: BlockId,
    cache: ValueCache,
    provenance: Provenance,
    derived: DerivedBases<'arena>,
    /// Phis waiting for their inputs.
    pending_phis: Vec<(NodeId, Value)>,
    /// Representation casts of phi inputs, shared by every incoming edge.
    phi_casts: HashMap<(Value, Type), Value>,
    layout: ParamLayout,
    fast_compression: bool,
    has_exceptions: bool,
    frame_address: Option<Value>,
    thread: Option<Value>,
    call_sites: Vec<CallSite>,
    reloc_sites: Vec<RelocSite>,
    handler_table: HashMap<BlockId, Vec<BlockId>>,
    next_stackmap: u64,
}

impl<'g, 'arena> Selector<'g, 'arena> {
    /// Create the target function and its blocks for `graph`.
    pub fn new(
        graph: &'g mut Graph,
        config: &'g SelectorConfig,
        session: &'g CompilationSession<'arena>,
    ) -> CompileResult<Self> {
        config.validate()?;
        let fast_compression = config.is_fast_compression();
        let signature = graph.signature().clone();
        let layout = ParamLayout::new(&signature.params, config.general_param_quota, |bt| {
            basic_type(bt, fast_compression)
        })?;
        let ret = basic_type(signature.ret, fast_compression)?;

        let mut builder = FunctionBuilder::new(
            graph.name(),
            layout.types().to_vec(),
            ret,
            config.pointer_size,
        );
        let entry = builder.add_block("B0", BlockOrigin::Entry);
        let blocks = graph
            .blocks()
            .map(|b| builder.add_block(format!("B{}", b.0 + 1), BlockOrigin::Source(b)))
            .collect();

        let has_exceptions = graph.has_exceptions();
        let cache = ValueCache::with_capacity(graph.node_count());
        Ok(Self {
            graph,
            config,
            session,
            builder,
            entry,
            blocks,
            block: BlockId(0),
            cache,
            provenance: Provenance::new(config.track_provenance),
            derived: DerivedBases::new(session.arena()),
            pending_phis: Vec::new(),
            phi_casts: HashMap::new(),
            layout,
            fast_compression,
            has_exceptions,
            frame_address: None,
            thread: None,
            call_sites: Vec::new(),
            reloc_sites: Vec::new(),
            handler_table: HashMap::new(),
            next_stackmap: 0,
        })
    }

    /// Lower the whole unit.
    pub fn run(mut self) -> CompileResult<Selection> {
        let name = self.graph.name().to_string();
        self.session.set_current_unit(&name);
        debug!(
            "selecting {} ({} blocks, {} nodes)",
            name,
            self.graph.number_of_blocks(),
            self.graph.node_count()
        );

        if let Err(e) = self.run_passes() {
            error!("selection of {name} failed: {e}");
            return Err(e);
        }

        let function = self.builder.finish();
        trace!("{function}");
        debug!(
            "selected {}: {} target blocks, {} call sites, {} reloc sites",
            name,
            function.blocks.len(),
            self.call_sites.len(),
            self.reloc_sites.len()
        );
        Ok(Selection {
            function,
            blocks: self.blocks,
            param_layout: self.layout,
            provenance: self.provenance,
            call_sites: self.call_sites,
            reloc_sites: self.reloc_sites,
            handler_table: self.handler_table,
            frame_address: self.frame_address,
            thread: self.thread,
        })
    }

    fn run_passes(&mut self) -> CompileResult<()> {
        self.prolog()?;
        self.select()?;
        self.complete_phi_nodes()?;
        self.verify_terminated()
    }

    fn prolog(&mut self) -> CompileResult<()> {
        self.builder.position_at_end(self.entry);
        self.frame_address = Some(self.builder.emit_value(Op::FrameAddress)?);

        let index = self
            .builder
            .const_int(Type::I32, self.config.thread.thread_index as u64);
        let thread = self.builder.emit_value(Op::CallC {
            target: self.config.thread.tls_accessor,
            args: vec![index],
            ret: Type::Ptr,
        })?;
        self.thread = Some(thread);

        self.builder.emit(Op::Alloca {
            bytes: self.config.frame_size,
        })?;

        let root = self.blocks[self.graph.root_block().index()];
        self.builder.br(root)
    }

    fn select(&mut self) -> CompileResult<()> {
        let root = self.graph.root_block();
        self.block = root;
        self.builder.position_at_end(self.blocks[root.index()]);
        let first = self.successor(root, 0)?;
        self.builder.br(first)?;

        let layout: Vec<BlockId> = self.graph.blocks().filter(|b| *b != root).collect();
        for block in layout {
            self.block = block;
            self.builder.position_at_end(self.blocks[block.index()]);
            let nodes: Vec<NodeId> = self.graph.block_nodes(block).collect();
            let mut block_addr_set = false;
            for node in nodes {
                if self.has_exceptions && !block_addr_set && !self.graph.node(node).kind.is_phi() {
                    let id = StackMapId::new(StackMapKind::BlockStart, block.0 as u64);
                    self.builder.stackmap(id)?;
                    block_addr_set = true;
                }
                self.select_node(node)?;
            }
            self.fall_through()?;
        }
        Ok(())
    }

    /// Terminate a block whose nodes did not transfer control.
    fn fall_through(&mut self) -> CompileResult<()> {
        let Some(current) = self.builder.current_block() else {
            return Ok(());
        };
        if self.builder.has_terminator(current) {
            return Ok(());
        }
        let succs = self.graph.block(self.block).succs.len();
        if succs != 1 {
            return Err(CompileError::BlockLayout {
                block: Some(self.block),
                reason: format!("block ends without a terminator and has {succs} successors"),
            });
        }
        let next = self.successor(self.block, 0)?;
        self.builder.br(next)
    }

    fn verify_terminated(&self) -> CompileResult<()> {
        let func = self.builder.function();
        match func.blocks.iter().find(|b| b.terminator.is_none()) {
            Some(b) => Err(CompileError::BlockLayout {
                block: match b.origin {
                    BlockOrigin::Source(id)
                    | BlockOrigin::CallResult(id)
                    | BlockOrigin::HandlerDispatch(id) => Some(id),
                    BlockOrigin::Entry => None,
                },
                reason: format!("{} has no terminator", b.name),
            }),
            None => Ok(()),
        }
    }

    /// Target block of successor `index` of `block`, skipping connectors.
    fn successor(&self, block: BlockId, index: usize) -> CompileResult<BlockRef> {
        let succ = self
            .graph
            .non_connector_successor(block, index)
            .ok_or_else(|| CompileError::BlockLayout {
                block: Some(block),
                reason: format!("no successor {index}"),
            })?;
        Ok(self.blocks[succ.index()])
    }

    /// Target block entered through the control projection `proj`.
    fn projection_target(&self, proj: NodeId) -> CompileResult<(BlockId, BlockRef)> {
        let head = self
            .graph
            .outs(proj)
            .first()
            .copied()
            .ok_or(CompileError::MalformedNode {
                node: proj,
                reason: "projection without a successor".to_string(),
            })?;
        let block = self
            .graph
            .block_for_node(head)
            .and_then(|b| self.graph.non_connector(b))
            .ok_or_else(|| CompileError::BlockLayout {
                block: Some(self.block),
                reason: format!("successor of {proj} is not scheduled"),
            })?;
        Ok((block, self.blocks[block.index()]))
    }

    fn next_stackmap_id(&mut self, kind: StackMapKind) -> StackMapId {
        let id = StackMapId::new(kind, self.next_stackmap);
        self.next_stackmap += 1;
        id
    }

    fn type_of(&self, bt: BasicType) -> CompileResult<Type> {
        basic_type(bt, self.fast_compression)
    }

    fn thread(&self) -> CompileResult<Value> {
        self.thread.ok_or_else(|| CompileError::BlockLayout {
            block: None,
            reason: "thread pointer used before the prolog".to_string(),
        })
    }

    /// Lower `node` once; later calls return the cached result.
    pub(crate) fn select_node(&mut self, node: NodeId) -> CompileResult<Lowered> {
        if let Some(val) = self.cache.lookup(node) {
            return Ok(val);
        }
        let val = self.lower(node)?;
        trace!("lowered {} {} -> {:?}", self.graph.node(node).kind.name(), node, val);
        self.cache.record(node, val);
        self.session.record_node_lowered();
        Ok(val)
    }

    fn value_of(&mut self, node: NodeId) -> CompileResult<Value> {
        self.select_node(node)?.ok_or_else(|| CompileError::MalformedNode {
            node,
            reason: format!("{} produces no value", self.graph.node(node).kind.name()),
        })
    }

    fn input_node(&self, node: NodeId, index: usize) -> CompileResult<NodeId> {
        self.graph
            .node(node)
            .input(index)
            .ok_or(CompileError::MissingInput { node, index })
    }

    fn input_value(&mut self, node: NodeId, index: usize) -> CompileResult<Value> {
        let input = self.input_node(node, index)?;
        self.value_of(input)
    }

    /// Record the provenance implied by a node's type.
    fn tag_value(&mut self, node: NodeId, ty: NodeType, value: Value) -> CompileResult<()> {
        if !self.provenance.is_enabled() {
            return Ok(());
        }
        match ty.basic {
            BasicType::Object if ty.offset == 0 => self.provenance.mark_mptr(value),
            BasicType::Object => {
                let base = self
                    .derived
                    .find_derived_base(self.graph, node, self.session)?;
                let base_value = self.value_of(base)?;
                self.provenance.mark_dptr(value, base_value)
            }
            BasicType::NarrowOop => self.provenance.mark_nptr(value, self.fast_compression),
            _ => Ok(()),
        }
    }

    fn lower(&mut self, node: NodeId) -> CompileResult<Lowered> {
        let n = self.graph.node(node).clone();
        let value = match &n.kind {
            NodeKind::Start
            | NodeKind::Region
            | NodeKind::IfTrue
            | NodeKind::IfFalse
            | NodeKind::Catch
            | NodeKind::CatchProj { .. } => None,

            NodeKind::Parm(index) => {
                let arg = self
                    .layout
                    .param_to_arg(*index as usize)
                    .and_then(|arg| self.builder.param(arg))
                    .ok_or_else(|| CompileError::MalformedNode {
                        node,
                        reason: format!("no argument carries parameter {index}"),
                    })?;
                Some(arg)
            }

            NodeKind::ConI(v) => Some(self.builder.const_int(Type::I32, *v as u32 as u64)),
            NodeKind::ConL(v) => Some(self.builder.const_int(Type::I64, *v as u64)),
            NodeKind::ConF(v) => {
                let c = self.builder.const_f32(*v);
                self.reloc_sites.push(RelocSite {
                    anchor: RelocAnchor::Constant(c),
                    request: RelocRequest::Float(*v),
                });
                Some(c)
            }
            NodeKind::ConD(v) => {
                let c = self.builder.const_f64(*v);
                self.reloc_sites.push(RelocSite {
                    anchor: RelocAnchor::Constant(c),
                    request: RelocRequest::Double(*v),
                });
                Some(c)
            }
            NodeKind::ConP(addr) => {
                let c = self.builder.const_ptr(*addr);
                if *addr != 0 {
                    self.reloc_sites.push(RelocSite {
                        anchor: RelocAnchor::Constant(c),
                        request: RelocRequest::Debug(DebugInfo::Oop(*addr)),
                    });
                }
                Some(c)
            }
            NodeKind::ConN(addr) => Some(self.narrow_oop_constant(*addr)?),
            NodeKind::ConNKlass(addr) => Some(self.narrow_klass_constant(node, *addr)?),
            NodeKind::ConMeta(addr) | NodeKind::ConRaw(addr) => Some(self.builder.const_ptr(*addr)),

            NodeKind::AddP { offset } => Some(self.lower_addp(node, *offset)?),
            NodeKind::Binary(op) => Some(self.lower_binary(node, *op, n.ty)?),
            NodeKind::Conv(op) => Some(self.lower_conv(node, *op, n.ty)?),
            NodeKind::Cmp(kind) => Some(self.select_condition(node, *kind)?),
            NodeKind::If(_) => {
                self.select_if(node)?;
                None
            }
            NodeKind::Goto => {
                let next = self.successor(self.block, 0)?;
                self.builder.br(next)?;
                None
            }
            NodeKind::Return => {
                let value = match n.input(1) {
                    Some(input) if self.builder.function().ret != Type::Void => {
                        Some(self.value_of(input)?)
                    }
                    _ => None,
                };
                self.builder.set_terminator(Terminator::Ret(value))?;
                None
            }
            NodeKind::Halt => {
                self.builder.set_terminator(Terminator::Unreachable)?;
                None
            }

            NodeKind::Load { mem, ty } => Some(self.lower_load(node, *mem, *ty)?),
            NodeKind::Store { mem, ty } => {
                self.lower_store(node, *mem, *ty)?;
                None
            }
            NodeKind::CompareAndSwap { mem } => Some(self.lower_cas(node, *mem)?),

            NodeKind::DecodeN { not_null } => {
                let narrow = self.input_value(node, 1)?;
                Some(self.decode_heap_oop(narrow, *not_null)?)
            }
            NodeKind::EncodeP { not_null } => {
                let oop = self.input_value(node, 1)?;
                Some(self.encode_heap_oop(oop, *not_null)?)
            }
            NodeKind::DecodeNKlass => {
                let narrow = self.input_value(node, 1)?;
                Some(self.decode_klass_not_null(narrow)?)
            }
            NodeKind::LoadKlass => {
                let obj = self.input_value(node, 1)?;
                Some(self.load_klass_not_null(obj)?)
            }

            NodeKind::ThreadLocal => Some(self.thread()?),
            NodeKind::ThreadField(field) => {
                let offset = match field {
                    ThreadField::TlabTop => self.config.thread.tlab_top_offset,
                    ThreadField::TlabEnd => self.config.thread.tlab_end_offset,
                };
                let thread = self.thread()?;
                Some(self.gep_const(thread, offset)?)
            }

            NodeKind::Call(call) => self.lower_call(node, call)?,
            NodeKind::Rethrow => {
                self.lower_rethrow(node)?;
                None
            }
            NodeKind::Proj => {
                let of = self.input_node(node, 0)?;
                self.select_node(of)?
            }
            NodeKind::Phi => Some(self.lower_phi(node, n.ty)?),
        };

        if let Some(v) = value {
            if !matches!(n.kind, NodeKind::Phi) {
                self.tag_value(node, n.ty, v)?;
            }
        }
        Ok(value)
    }

    fn lower_binary(&mut self, node: NodeId, op: BinaryOp, ty: NodeType) -> CompileResult<Value> {
        let lhs = self.input_value(node, 1)?;
        let mut rhs = self.input_value(node, 2)?;
        let lty = self.builder.value_type(lhs);
        if !(lty.is_int() || lty.is_float()) {
            return Err(CompileError::UnsupportedType {
                ty: ty.basic,
                context: "arithmetic operand",
            });
        }
        let op = if lty.is_float() {
            match op {
                BinaryOp::Add => BinOp::FAdd,
                BinaryOp::Sub => BinOp::FSub,
                BinaryOp::Mul => BinOp::FMul,
                _ => {
                    return Err(CompileError::UnsupportedType {
                        ty: ty.basic,
                        context: "bitwise operation",
                    })
                }
            }
        } else {
            match op {
                BinaryOp::Add => BinOp::Add,
                BinaryOp::Sub => BinOp::Sub,
                BinaryOp::Mul => BinOp::Mul,
                BinaryOp::And => BinOp::And,
                BinaryOp::Or => BinOp::Or,
                BinaryOp::Xor => BinOp::Xor,
                BinaryOp::Shl => BinOp::Shl,
                BinaryOp::Shr => BinOp::LShr,
                BinaryOp::Sar => BinOp::AShr,
            }
        };
        // Long shifts take an int count.
        let rty = self.builder.value_type(rhs);
        if rty != lty && rty.is_int() && lty.is_int() {
            let cast = if rty.bits(64) < lty.bits(64) {
                CastOp::ZExt
            } else {
                CastOp::Trunc
            };
            rhs = self.builder.cast(cast, rhs, lty)?;
        } else if rty != lty {
            return Err(CompileError::MalformedNode {
                node,
                reason: format!("operand types {lty} and {rty} differ"),
            });
        }
        self.builder.binary(op, lhs, rhs)
    }

    fn lower_conv(&mut self, node: NodeId, op: ConvOp, ty: NodeType) -> CompileResult<Value> {
        let input = self.input_value(node, 1)?;
        let to = self.type_of(ty.basic)?;
        let cast = match op {
            ConvOp::I2L => CastOp::SExt,
            ConvOp::UI2L => CastOp::ZExt,
            ConvOp::L2I => CastOp::Trunc,
            ConvOp::P2X => CastOp::PtrToInt,
            ConvOp::X2P => CastOp::IntToPtr,
        };
        self.builder.cast(cast, input, to)
    }

    /// Resize an integer to `to`, no-op when the widths agree.
    fn int_resize(&mut self, value: Value, to: Type, signed: bool) -> CompileResult<Value> {
        let from = self.builder.value_type(value);
        let ptr_bits = self.builder.ptr_bits();
        let (fb, tb) = (from.bits(ptr_bits), to.bits(ptr_bits));
        if fb == tb {
            return Ok(value);
        }
        let op = if fb > tb {
            CastOp::Trunc
        } else if signed {
            CastOp::SExt
        } else {
            CastOp::ZExt
        };
        self.builder.cast(op, value, to)
    }

    fn word_type(&self) -> Type {
        Type::int(self.config.pointer_size)
    }
}
