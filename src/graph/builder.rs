//! Programmatic construction of scheduled graphs.
//!
//! Host adaptors and tests describe a unit block by block. Every block
//! starts with its entry marker; control edges are created by the block
//! ends (`goto`, `branch`, `catch`) and wire the successor's region input
//! and predecessor list in one step, so phi inputs line up with `preds`.

use super::{
    BasicType, Block, BlockId, CallNode, CmpKind, CondCode, Graph, MemOperand, Node, NodeId,
    NodeKind, NodeType, Signature, ThreadField, AddPOffset, BinaryOp, ConvOp,
};

pub struct GraphBuilder {
    name: String,
    signature: Signature,
    nodes: Vec<Node>,
    blocks: Vec<Block>,
    node_block: Vec<Option<BlockId>>,
}

impl GraphBuilder {
    /// Start a unit; block 0 is the root block holding the start node.
    pub fn new(name: impl Into<String>, signature: Signature) -> Self {
        let mut builder = Self {
            name: name.into(),
            signature,
            nodes: Vec::new(),
            blocks: Vec::new(),
            node_block: Vec::new(),
        };
        builder.new_block(NodeKind::Start, false);
        builder
    }

    pub fn root(&self) -> BlockId {
        BlockId(0)
    }

    pub fn start(&self) -> NodeId {
        self.blocks[0].nodes[0]
    }

    /// Append a regular block.
    pub fn block(&mut self) -> BlockId {
        self.new_block(NodeKind::Region, false)
    }

    /// Append a connector block; it only passes control to its successor.
    pub fn connector(&mut self) -> BlockId {
        self.new_block(NodeKind::Region, true)
    }

    fn new_block(&mut self, head: NodeKind, connector: bool) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block {
            connector,
            ..Block::default()
        });
        self.push(id, Node::new(head, NodeType::CONTROL, vec![None]));
        id
    }

    fn push(&mut self, block: BlockId, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        self.node_block.push(Some(block));
        self.blocks[block.index()].nodes.push(id);
        id
    }

    /// Append an arbitrary node to `block`.
    pub fn node(
        &mut self,
        block: BlockId,
        kind: NodeKind,
        ty: NodeType,
        inputs: Vec<Option<NodeId>>,
    ) -> NodeId {
        self.push(block, Node::new(kind, ty, inputs))
    }

    fn link(&mut self, from: BlockId, to: BlockId, ctrl: NodeId) {
        self.blocks[from.index()].succs.push(to);
        self.blocks[to.index()].preds.push(from);
        let head = self.blocks[to.index()].nodes[0];
        self.nodes[head.index()].inputs.push(Some(ctrl));
    }

    /// Incoming parameter `index` of the signature, scheduled in the root block.
    pub fn parm(&mut self, index: u32) -> NodeId {
        let basic = self
            .signature
            .params
            .get(index as usize)
            .copied()
            .unwrap_or(BasicType::Void);
        let start = self.start();
        self.push(
            self.root(),
            Node::new(NodeKind::Parm(index), NodeType::of(basic), vec![Some(start)]),
        )
    }

    fn con(&mut self, block: BlockId, kind: NodeKind, basic: BasicType) -> NodeId {
        self.push(block, Node::new(kind, NodeType::of(basic), vec![None]))
    }

    pub fn con_i(&mut self, block: BlockId, value: i32) -> NodeId {
        self.con(block, NodeKind::ConI(value), BasicType::Int)
    }

    pub fn con_l(&mut self, block: BlockId, value: i64) -> NodeId {
        self.con(block, NodeKind::ConL(value), BasicType::Long)
    }

    pub fn con_f(&mut self, block: BlockId, value: f32) -> NodeId {
        self.con(block, NodeKind::ConF(value), BasicType::Float)
    }

    pub fn con_d(&mut self, block: BlockId, value: f64) -> NodeId {
        self.con(block, NodeKind::ConD(value), BasicType::Double)
    }

    pub fn con_p(&mut self, block: BlockId, addr: u64) -> NodeId {
        self.con(block, NodeKind::ConP(addr), BasicType::Object)
    }

    /// Pointer constant `offset` bytes past `addr` (typically null plus offset).
    pub fn con_p_derived(&mut self, block: BlockId, addr: u64, offset: i64) -> NodeId {
        self.push(
            block,
            Node::new(NodeKind::ConP(addr), NodeType::derived(offset), vec![None]),
        )
    }

    pub fn con_n(&mut self, block: BlockId, addr: u64) -> NodeId {
        self.con(block, NodeKind::ConN(addr), BasicType::NarrowOop)
    }

    pub fn con_nklass(&mut self, block: BlockId, addr: u64) -> NodeId {
        self.con(block, NodeKind::ConNKlass(addr), BasicType::NarrowKlass)
    }

    pub fn con_meta(&mut self, block: BlockId, addr: u64) -> NodeId {
        self.con(block, NodeKind::ConMeta(addr), BasicType::Metadata)
    }

    pub fn con_raw(&mut self, block: BlockId, addr: u64) -> NodeId {
        self.con(block, NodeKind::ConRaw(addr), BasicType::Address)
    }

    pub fn binary(
        &mut self,
        block: BlockId,
        op: BinaryOp,
        basic: BasicType,
        lhs: NodeId,
        rhs: NodeId,
    ) -> NodeId {
        self.push(
            block,
            Node::new(NodeKind::Binary(op), NodeType::of(basic), vec![None, Some(lhs), Some(rhs)]),
        )
    }

    pub fn conv(&mut self, block: BlockId, op: ConvOp, basic: BasicType, input: NodeId) -> NodeId {
        self.push(
            block,
            Node::new(NodeKind::Conv(op), NodeType::of(basic), vec![None, Some(input)]),
        )
    }

    /// Address node with a register offset.
    pub fn addp(
        &mut self,
        block: BlockId,
        ty: NodeType,
        base: NodeId,
        address: NodeId,
        offset: NodeId,
    ) -> NodeId {
        self.push(
            block,
            Node::new(
                NodeKind::AddP {
                    offset: AddPOffset::Reg,
                },
                ty,
                vec![None, Some(base), Some(address), Some(offset)],
            ),
        )
    }

    /// Address node with an immediate offset.
    pub fn addp_imm(
        &mut self,
        block: BlockId,
        ty: NodeType,
        base: NodeId,
        address: NodeId,
        offset: i64,
    ) -> NodeId {
        self.push(
            block,
            Node::new(
                NodeKind::AddP {
                    offset: AddPOffset::Imm(offset),
                },
                ty,
                vec![None, Some(base), Some(address)],
            ),
        )
    }

    pub fn load(&mut self, block: BlockId, mem: MemOperand, ty: BasicType, address: NodeId) -> NodeId {
        self.push(
            block,
            Node::new(NodeKind::Load { mem, ty }, NodeType::of(ty), vec![None, None, Some(address)]),
        )
    }

    pub fn store(
        &mut self,
        block: BlockId,
        mem: MemOperand,
        ty: BasicType,
        address: NodeId,
        value: NodeId,
    ) -> NodeId {
        self.push(
            block,
            Node::new(
                NodeKind::Store { mem, ty },
                NodeType::CONTROL,
                vec![None, None, Some(address), Some(value)],
            ),
        )
    }

    pub fn compare_and_swap(
        &mut self,
        block: BlockId,
        mem: MemOperand,
        address: NodeId,
        expected: NodeId,
        new_value: NodeId,
    ) -> NodeId {
        self.push(
            block,
            Node::new(
                NodeKind::CompareAndSwap { mem },
                NodeType::of(BasicType::Int),
                vec![None, None, Some(address), Some(expected), Some(new_value)],
            ),
        )
    }

    pub fn decode_n(&mut self, block: BlockId, narrow: NodeId, not_null: bool) -> NodeId {
        self.push(
            block,
            Node::new(
                NodeKind::DecodeN { not_null },
                NodeType::of(BasicType::Object),
                vec![None, Some(narrow)],
            ),
        )
    }

    pub fn encode_p(&mut self, block: BlockId, oop: NodeId, not_null: bool) -> NodeId {
        self.push(
            block,
            Node::new(
                NodeKind::EncodeP { not_null },
                NodeType::of(BasicType::NarrowOop),
                vec![None, Some(oop)],
            ),
        )
    }

    pub fn decode_nklass(&mut self, block: BlockId, narrow: NodeId) -> NodeId {
        self.push(
            block,
            Node::new(
                NodeKind::DecodeNKlass,
                NodeType::of(BasicType::Metadata),
                vec![None, Some(narrow)],
            ),
        )
    }

    pub fn load_klass(&mut self, block: BlockId, obj: NodeId) -> NodeId {
        self.push(
            block,
            Node::new(
                NodeKind::LoadKlass,
                NodeType::of(BasicType::Metadata),
                vec![None, Some(obj)],
            ),
        )
    }

    pub fn thread_local(&mut self, block: BlockId) -> NodeId {
        self.push(
            block,
            Node::new(NodeKind::ThreadLocal, NodeType::of(BasicType::Address), vec![None]),
        )
    }

    pub fn thread_field(&mut self, block: BlockId, field: ThreadField) -> NodeId {
        self.push(
            block,
            Node::new(
                NodeKind::ThreadField(field),
                NodeType::of(BasicType::Address),
                vec![None],
            ),
        )
    }

    pub fn cmp(&mut self, block: BlockId, kind: CmpKind, lhs: NodeId, rhs: NodeId) -> NodeId {
        self.push(
            block,
            Node::new(
                NodeKind::Cmp(kind),
                NodeType::of(BasicType::Int),
                vec![None, Some(lhs), Some(rhs)],
            ),
        )
    }

    /// Merge of `inputs`, one per predecessor of `block`, placed after
    /// the block's existing phis.
    pub fn phi(&mut self, block: BlockId, ty: NodeType, inputs: &[NodeId]) -> NodeId {
        let region = self.blocks[block.index()].nodes[0];
        let mut node_inputs = vec![Some(region)];
        node_inputs.extend(inputs.iter().copied().map(Some));
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node::new(NodeKind::Phi, ty, node_inputs));
        self.node_block.push(Some(block));
        let nodes = &self.nodes;
        let block_nodes = &mut self.blocks[block.index()].nodes;
        let pos = block_nodes
            .iter()
            .skip(1)
            .position(|n| !nodes[n.index()].kind.is_phi())
            .map_or(block_nodes.len(), |p| p + 1);
        block_nodes.insert(pos, id);
        id
    }

    /// Call with its arguments; `Half` slots of the signature take no input.
    pub fn call(&mut self, block: BlockId, call: CallNode, args: &[NodeId]) -> NodeId {
        let mut inputs = vec![None];
        let mut args = args.iter().copied();
        for ty in &call.signature.params {
            if *ty == BasicType::Half {
                inputs.push(None);
            } else {
                inputs.push(args.next());
            }
        }
        let ret = call.signature.ret;
        self.push(
            block,
            Node::new(NodeKind::Call(Box::new(call)), NodeType::of(ret), inputs),
        )
    }

    /// Result projection of a call.
    pub fn proj(&mut self, block: BlockId, of: NodeId) -> NodeId {
        let ty = self.nodes[of.index()].ty;
        self.push(block, Node::new(NodeKind::Proj, ty, vec![Some(of)]))
    }

    pub fn goto(&mut self, from: BlockId, to: BlockId) -> NodeId {
        let goto = self.push(from, Node::new(NodeKind::Goto, NodeType::CONTROL, vec![None]));
        self.link(from, to, goto);
        goto
    }

    pub fn ret(&mut self, block: BlockId, value: Option<NodeId>) -> NodeId {
        self.push(
            block,
            Node::new(NodeKind::Return, NodeType::CONTROL, vec![None, value]),
        )
    }

    pub fn halt(&mut self, block: BlockId) -> NodeId {
        self.push(block, Node::new(NodeKind::Halt, NodeType::CONTROL, vec![None]))
    }

    pub fn rethrow(&mut self, block: BlockId, exception: NodeId) -> NodeId {
        self.push(
            block,
            Node::new(NodeKind::Rethrow, NodeType::CONTROL, vec![None, Some(exception)]),
        )
    }

    /// Two-way branch on `cmp`. `true_first` chooses which projection is
    /// created (and therefore used) first; successors follow that order.
    pub fn branch(
        &mut self,
        block: BlockId,
        cond: CondCode,
        cmp: NodeId,
        on_true: BlockId,
        on_false: BlockId,
        true_first: bool,
    ) -> NodeId {
        let if_node = self.push(
            block,
            Node::new(NodeKind::If(cond), NodeType::CONTROL, vec![None, Some(cmp)]),
        );
        let order = if true_first {
            [(NodeKind::IfTrue, on_true), (NodeKind::IfFalse, on_false)]
        } else {
            [(NodeKind::IfFalse, on_false), (NodeKind::IfTrue, on_true)]
        };
        for (kind, target) in order {
            let proj = self.push(block, Node::new(kind, NodeType::CONTROL, vec![Some(if_node)]));
            self.link(block, target, proj);
        }
        if_node
    }

    /// Exception dispatch after a call. Each target is `(con, block)`;
    /// `FALL_THROUGH_INDEX` marks the normal continuation.
    pub fn catch(&mut self, block: BlockId, targets: &[(u32, BlockId)]) -> NodeId {
        let catch = self.push(block, Node::new(NodeKind::Catch, NodeType::CONTROL, vec![None]));
        for &(con, target) in targets {
            let proj = self.push(
                block,
                Node::new(NodeKind::CatchProj { con }, NodeType::CONTROL, vec![Some(catch)]),
            );
            self.link(block, target, proj);
        }
        catch
    }

    pub fn finish(self) -> Graph {
        Graph::from_parts(
            self.name,
            self.signature,
            self.nodes,
            self.blocks,
            self.node_block,
        )
    }
}
