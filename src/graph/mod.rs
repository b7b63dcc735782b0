//! Scheduled machine-node graph consumed by the selector.
//!
//! The optimizer hands over a graph whose nodes are already matched and
//! scheduled into basic blocks. Nodes keep positional input edges using the
//! optimizer's slot conventions (control at 0, address at 2 for memory
//! nodes, base/address/offset at 1/2/3 for address arithmetic). Def-use
//! lists are derived from the inputs in node creation order, which is what
//! lets branch lowering see the order of a branch's projections.
//!
//! ```text
//! b0: Start  Parm(0)  Parm(1)  Goto            -> b1
//! b1: Region ConI(1)  Cmp(Int) If(Lt) IfTrue IfFalse -> b2, b3
//! b2: Region Return(Parm(0))
//! b3: Region Return(ConI(1))
//! ```

use std::fmt;

use crate::core::adaptor::CfgWalker;

pub mod builder;

pub use builder::GraphBuilder;

/// Index of a node in the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Index of a block in layout order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

/// Basic types of values, parameters and memory accesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BasicType {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    /// Full-width heap pointer.
    Object,
    /// Compressed heap pointer.
    NarrowOop,
    NarrowKlass,
    Metadata,
    /// Raw machine address.
    Address,
    Void,
    /// Second slot of a two-slot long/double parameter.
    Half,
}

impl BasicType {
    pub fn is_float(self) -> bool {
        matches!(self, BasicType::Float | BasicType::Double)
    }

    /// Full-width pointer types.
    pub fn is_ptr(self) -> bool {
        matches!(self, BasicType::Object | BasicType::Metadata | BasicType::Address)
    }
}

/// Bottom type of a node: its basic type and, for pointers, the offset
/// from the start of the object it points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeType {
    pub basic: BasicType,
    pub offset: i64,
}

impl NodeType {
    pub const CONTROL: NodeType = NodeType::of(BasicType::Void);

    pub const fn of(basic: BasicType) -> Self {
        Self { basic, offset: 0 }
    }

    /// Interior pointer `offset` bytes into an object.
    pub const fn derived(offset: i64) -> Self {
        Self {
            basic: BasicType::Object,
            offset,
        }
    }

    pub fn is_ptr(&self) -> bool {
        self.basic.is_ptr()
    }
}

/// Offset operand of an address node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddPOffset {
    /// Offset is the node at input `OFFSET`.
    Reg,
    /// Offset is an immediate operand.
    Imm(i64),
}

/// Memory operand shape of a load/store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemOperand {
    /// The address input is a full address expression.
    Indirect,
    /// The address input is a base plus a constant displacement.
    IndOffset(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    /// Logical shift right.
    Shr,
    /// Arithmetic shift right.
    Sar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvOp {
    /// Sign-extend int to long.
    I2L,
    /// Zero-extend int to long.
    UI2L,
    /// Truncate long to int.
    L2I,
    /// Pointer to machine word.
    P2X,
    /// Machine word to pointer.
    X2P,
}

/// Flavor of a compare node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpKind {
    /// Integer or pointer comparison of the two operands.
    Int,
    /// Floating comparison, unordered predicates.
    Float,
    /// Tests `(a & b)` against zero.
    And,
}

/// Condition code carried by a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CondCode {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Ult,
    Ule,
    Ugt,
    Uge,
}

impl CondCode {
    pub const ALL: [CondCode; 10] = [
        CondCode::Eq,
        CondCode::Ne,
        CondCode::Lt,
        CondCode::Le,
        CondCode::Gt,
        CondCode::Ge,
        CondCode::Ult,
        CondCode::Ule,
        CondCode::Ugt,
        CondCode::Uge,
    ];

    /// Operand encoding used by the matcher.
    pub fn ccode(self) -> u8 {
        self as u8
    }

    pub fn is_unsigned(self) -> bool {
        matches!(self, CondCode::Ult | CondCode::Ule | CondCode::Ugt | CondCode::Uge)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadField {
    TlabTop,
    TlabEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// Statically bound Java call.
    StaticJava,
    /// Java call dispatched through an inline cache.
    DynamicJava,
    /// Call into the runtime or a C leaf routine.
    Runtime,
}

/// Resolved target method of a Java call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRef {
    pub name: String,
    pub is_static: bool,
}

/// Typed signature; `params` keeps `Half` slots of two-slot values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub params: Vec<BasicType>,
    pub ret: BasicType,
}

impl Signature {
    pub fn new(params: Vec<BasicType>, ret: BasicType) -> Self {
        Self { params, ret }
    }
}

/// Call payload. Arguments are inputs `PARMS..PARMS + params.len()`;
/// `Half` slots carry no input.
#[derive(Debug, Clone, PartialEq)]
pub struct CallNode {
    pub kind: CallKind,
    pub entry_point: u64,
    pub method: Option<MethodRef>,
    pub signature: Signature,
    /// Values live in the interpreter state at the call.
    pub debug: Vec<NodeId>,
}

/// Closed set of machine node kinds the selector lowers.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Start,
    Region,
    Parm(u32),
    ConI(i32),
    ConL(i64),
    ConF(f32),
    ConD(f64),
    /// Heap object constant by address; 0 is null.
    ConP(u64),
    /// Narrow oop constant, given as the full object address.
    ConN(u64),
    /// Narrow klass constant, given as the full klass address.
    ConNKlass(u64),
    ConMeta(u64),
    ConRaw(u64),
    AddP { offset: AddPOffset },
    Binary(BinaryOp),
    Conv(ConvOp),
    Cmp(CmpKind),
    If(CondCode),
    IfTrue,
    IfFalse,
    Goto,
    Return,
    Halt,
    Load { mem: MemOperand, ty: BasicType },
    Store { mem: MemOperand, ty: BasicType },
    CompareAndSwap { mem: MemOperand },
    DecodeN { not_null: bool },
    EncodeP { not_null: bool },
    DecodeNKlass,
    LoadKlass,
    ThreadLocal,
    ThreadField(ThreadField),
    Call(Box<CallNode>),
    Rethrow,
    Catch,
    CatchProj { con: u32 },
    /// Projection of a call's result or another multi-output node.
    Proj,
    Phi,
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Start => "Start",
            NodeKind::Region => "Region",
            NodeKind::Parm(_) => "Parm",
            NodeKind::ConI(_) => "ConI",
            NodeKind::ConL(_) => "ConL",
            NodeKind::ConF(_) => "ConF",
            NodeKind::ConD(_) => "ConD",
            NodeKind::ConP(_) => "ConP",
            NodeKind::ConN(_) => "ConN",
            NodeKind::ConNKlass(_) => "ConNKlass",
            NodeKind::ConMeta(_) => "ConMeta",
            NodeKind::ConRaw(_) => "ConRaw",
            NodeKind::AddP { .. } => "AddP",
            NodeKind::Binary(_) => "Binary",
            NodeKind::Conv(_) => "Conv",
            NodeKind::Cmp(_) => "Cmp",
            NodeKind::If(_) => "If",
            NodeKind::IfTrue => "IfTrue",
            NodeKind::IfFalse => "IfFalse",
            NodeKind::Goto => "Goto",
            NodeKind::Return => "Return",
            NodeKind::Halt => "Halt",
            NodeKind::Load { .. } => "Load",
            NodeKind::Store { .. } => "Store",
            NodeKind::CompareAndSwap { .. } => "CompareAndSwap",
            NodeKind::DecodeN { .. } => "DecodeN",
            NodeKind::EncodeP { .. } => "EncodeP",
            NodeKind::DecodeNKlass => "DecodeNKlass",
            NodeKind::LoadKlass => "LoadKlass",
            NodeKind::ThreadLocal => "ThreadLocal",
            NodeKind::ThreadField(_) => "ThreadField",
            NodeKind::Call(_) => "Call",
            NodeKind::Rethrow => "Rethrow",
            NodeKind::Catch => "Catch",
            NodeKind::CatchProj { .. } => "CatchProj",
            NodeKind::Proj => "Proj",
            NodeKind::Phi => "Phi",
        }
    }

    pub fn is_con(&self) -> bool {
        matches!(
            self,
            NodeKind::ConI(_)
                | NodeKind::ConL(_)
                | NodeKind::ConF(_)
                | NodeKind::ConD(_)
                | NodeKind::ConP(_)
                | NodeKind::ConN(_)
                | NodeKind::ConNKlass(_)
                | NodeKind::ConMeta(_)
                | NodeKind::ConRaw(_)
        )
    }

    pub fn is_phi(&self) -> bool {
        matches!(self, NodeKind::Phi)
    }

    /// Block ends that already transfer control unconditionally.
    pub fn is_unconditional_end(&self) -> bool {
        matches!(
            self,
            NodeKind::Goto | NodeKind::Return | NodeKind::Halt | NodeKind::Rethrow
        )
    }
}

/// Sentinel `CatchProj` index of the normal continuation.
pub const FALL_THROUGH_INDEX: u32 = 0;

/// Input slot conventions.
pub mod slots {
    /// Address input of loads, stores and address nodes.
    pub const ADDRESS: usize = 2;
    /// Stored value.
    pub const VALUE_IN: usize = 3;
    /// Expected and new values of a compare-and-swap.
    pub const EXPECTED: usize = 3;
    pub const NEW_VALUE: usize = 4;
    /// Base object of an address node.
    pub const BASE: usize = 1;
    pub const OFFSET: usize = 3;
    /// First argument of a call.
    pub const PARMS: usize = 1;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub kind: NodeKind,
    pub ty: NodeType,
    pub inputs: Vec<Option<NodeId>>,
}

impl Node {
    pub fn new(kind: NodeKind, ty: NodeType, inputs: Vec<Option<NodeId>>) -> Self {
        Self { kind, ty, inputs }
    }

    #[inline]
    pub fn input(&self, index: usize) -> Option<NodeId> {
        self.inputs.get(index).copied().flatten()
    }

    /// Number of input slots.
    #[inline]
    pub fn req(&self) -> usize {
        self.inputs.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Block {
    /// Scheduled nodes; index 0 is the entry marker.
    pub nodes: Vec<NodeId>,
    /// Predecessors, aligned with phi inputs `1..`.
    pub preds: Vec<BlockId>,
    pub succs: Vec<BlockId>,
    pub connector: bool,
}

impl Block {
    pub fn head(&self) -> Option<NodeId> {
        self.nodes.first().copied()
    }

    pub fn number_of_nodes(&self) -> usize {
        self.nodes.len()
    }
}

/// Scheduled machine-node graph of one compilation unit.
#[derive(Debug, Clone)]
pub struct Graph {
    name: String,
    signature: Signature,
    nodes: Vec<Node>,
    blocks: Vec<Block>,
    node_block: Vec<Option<BlockId>>,
    outs: Vec<Vec<NodeId>>,
    null_node: Option<NodeId>,
}

impl Graph {
    pub(crate) fn from_parts(
        name: String,
        signature: Signature,
        nodes: Vec<Node>,
        blocks: Vec<Block>,
        node_block: Vec<Option<BlockId>>,
    ) -> Self {
        let mut outs = vec![Vec::new(); nodes.len()];
        for (idx, node) in nodes.iter().enumerate() {
            for input in node.inputs.iter().flatten() {
                outs[input.index()].push(NodeId(idx as u32));
            }
        }
        Self {
            name,
            signature,
            nodes,
            blocks,
            node_block,
            outs,
            null_node: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Uses of `id` in node creation order.
    pub fn outs(&self, id: NodeId) -> &[NodeId] {
        &self.outs[id.index()]
    }

    pub fn unique_out(&self, id: NodeId) -> Option<NodeId> {
        match self.outs(id) {
            [single] => Some(*single),
            _ => None,
        }
    }

    /// The unit contains exception dispatch.
    pub fn has_exceptions(&self) -> bool {
        self.nodes.iter().any(|n| matches!(n.kind, NodeKind::Catch))
    }

    /// Insert `node` into `block` at position `pos` and keep def-use lists current.
    pub fn insert_node(&mut self, block: BlockId, pos: usize, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        for input in node.inputs.iter().flatten() {
            self.outs[input.index()].push(id);
        }
        self.nodes.push(node);
        self.outs.push(Vec::new());
        self.node_block.push(Some(block));
        let nodes = &mut self.blocks[block.index()].nodes;
        let pos = pos.min(nodes.len());
        nodes.insert(pos, id);
        id
    }

    /// Rewire input `index` of `node`.
    pub fn set_input(&mut self, node: NodeId, index: usize, input: Option<NodeId>) {
        let inputs = &mut self.nodes[node.index()].inputs;
        if inputs.len() <= index {
            inputs.resize(index + 1, None);
        }
        let old = std::mem::replace(&mut inputs[index], input);
        if let Some(old) = old {
            let outs = &mut self.outs[old.index()];
            if let Some(pos) = outs.iter().position(|n| *n == node) {
                outs.remove(pos);
            }
        }
        if let Some(new) = input {
            self.outs[new.index()].push(node);
        }
    }

    /// Canonical null pointer constant, created in the root block on first use.
    pub fn mach_null(&mut self) -> NodeId {
        if let Some(id) = self.null_node {
            return id;
        }
        let root = self.root_block();
        let id = self.insert_node(
            root,
            1,
            Node::new(NodeKind::ConP(0), NodeType::of(BasicType::Object), vec![None]),
        );
        self.null_node = Some(id);
        id
    }
}

impl CfgWalker for Graph {
    fn number_of_blocks(&self) -> usize {
        self.blocks.len()
    }

    fn root_block(&self) -> BlockId {
        BlockId(0)
    }

    fn block(&self, block: BlockId) -> &Block {
        &self.blocks[block.index()]
    }

    fn block_for_node(&self, node: NodeId) -> Option<BlockId> {
        self.node_block.get(node.index()).copied().flatten()
    }

    fn is_end_projection(&self, node: NodeId) -> bool {
        matches!(
            self.node(node).kind,
            NodeKind::IfTrue | NodeKind::IfFalse | NodeKind::CatchProj { .. }
        )
    }
}
