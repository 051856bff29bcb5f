use crate::*;

/*
 * The loop-nest IR is stored arena-style: one flat vector of nodes, one flat
 * vector of references, and flat symbol/blob tables, all addressed by dense
 * integer IDs. Nodes never move once created, so an ID stays meaningful for
 * the lifetime of the function, even across transformations that rewrite
 * bounds or bodies in place.
 */
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub nodes: Vec<Node>,
    pub parents: Vec<Option<NodeID>>,
    pub refs: Vec<DDRef>,
    pub symbols: Vec<Symbol>,
    pub blobs: Vec<Symbase>,
    pub roots: Vec<NodeID>,
    pub may_alias: Vec<(Symbase, Symbase)>,
}

/*
 * Lexical node kinds of the loop IR. Control structure is represented
 * directly as child lists - there is no separate CFG. Loops carry their
 * 1-based nesting level and canonical bound expressions; instructions own
 * the references the dependence engine works over.
 */
#[derive(Debug, Clone)]
pub enum Node {
    Region {
        children: Vec<NodeID>,
    },
    Loop {
        level: u32,
        lower: CanonExpr,
        upper: CanonExpr,
        stride: i64,
        children: Vec<NodeID>,
    },
    If {
        then_children: Vec<NodeID>,
        else_children: Vec<NodeID>,
    },
    Switch {
        cases: Vec<Vec<NodeID>>,
    },
    Inst {
        op: InstOp,
        refs: Vec<RefID>,
    },
    Label {
        name: String,
    },
    Goto {
        target: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstOp {
    Assign,
    Call { callee: String },
}

/*
 * A reference is a single memory or scalar access site. Memory references
 * carry one canonical subscript per array dimension plus the list of blob
 * sub-references nested inside those subscripts; scalar references are
 * terminal. A blob reference is the rvalue use of a temporary from within a
 * parent reference's subscript - it participates in the dependence graph
 * like any other scalar use.
 */
#[derive(Debug, Clone)]
pub struct DDRef {
    pub node: NodeID,
    pub symbase: Symbase,
    pub is_lval: bool,
    pub kind: RefKind,
}

#[derive(Debug, Clone)]
pub enum RefKind {
    Memory {
        subscripts: Vec<CanonExpr>,
        blobs: Vec<RefID>,
    },
    Scalar,
    Blob {
        parent: RefID,
    },
}

impl DDRef {
    pub fn is_memory(&self) -> bool {
        matches!(self.kind, RefKind::Memory { .. })
    }

    /// Scalar and blob references have no subscripts to analyze.
    pub fn is_terminal(&self) -> bool {
        !self.is_memory()
    }

    pub fn subscripts(&self) -> &[CanonExpr] {
        match &self.kind {
            RefKind::Memory { subscripts, .. } => subscripts,
            _ => &[],
        }
    }

    pub fn blob_refs(&self) -> &[RefID] {
        match &self.kind {
            RefKind::Memory { blobs, .. } => blobs,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Array,
    Scalar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeID(u32);

impl NodeID {
    pub fn new(x: usize) -> Self {
        NodeID(x as u32)
    }

    pub fn idx(&self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefID(u32);

impl RefID {
    pub fn new(x: usize) -> Self {
        RefID(x as u32)
    }

    pub fn idx(&self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbase(u32);

impl Symbase {
    pub fn new(x: usize) -> Self {
        Symbase(x as u32)
    }

    pub fn idx(&self) -> usize {
        self.0 as usize
    }
}

impl Function {
    pub fn new(name: String) -> Self {
        Function {
            name,
            nodes: vec![],
            parents: vec![],
            refs: vec![],
            symbols: vec![],
            blobs: vec![],
            roots: vec![],
            may_alias: vec![],
        }
    }

    /*
     * Construction helpers. Nodes are created parentless; the builder wires
     * parents up once the enclosing node exists (children are created before
     * their parent when parsing bottom-up).
     */
    pub fn new_node(&mut self, node: Node) -> NodeID {
        let id = NodeID::new(self.nodes.len());
        self.nodes.push(node);
        self.parents.push(None);
        id
    }

    pub fn set_parent(&mut self, child: NodeID, parent: NodeID) {
        self.parents[child.idx()] = Some(parent);
    }

    pub fn new_ref(&mut self, r: DDRef) -> RefID {
        let id = RefID::new(self.refs.len());
        self.refs.push(r);
        id
    }

    pub fn intern_symbol(&mut self, name: &str, kind: SymbolKind) -> Symbase {
        if let Some(idx) = self.symbols.iter().position(|s| s.name == name) {
            assert!(
                self.symbols[idx].kind == kind,
                "Symbol used as both array and scalar."
            );
            Symbase::new(idx)
        } else {
            let id = Symbase::new(self.symbols.len());
            self.symbols.push(Symbol {
                name: name.to_string(),
                kind,
            });
            id
        }
    }

    pub fn intern_blob(&mut self, symbase: Symbase) -> BlobID {
        if let Some(idx) = self.blobs.iter().position(|s| *s == symbase) {
            BlobID::new(idx)
        } else {
            let id = BlobID::new(self.blobs.len());
            self.blobs.push(symbase);
            id
        }
    }

    pub fn symbol(&self, s: Symbase) -> &Symbol {
        &self.symbols[s.idx()]
    }

    pub fn ddref(&self, r: RefID) -> &DDRef {
        &self.refs[r.idx()]
    }

    pub fn is_loop(&self, n: NodeID) -> bool {
        matches!(self.nodes[n.idx()], Node::Loop { .. })
    }

    pub fn is_region(&self, n: NodeID) -> bool {
        matches!(self.nodes[n.idx()], Node::Region { .. })
    }

    pub fn loop_level(&self, n: NodeID) -> u32 {
        match self.nodes[n.idx()] {
            Node::Loop { level, .. } => level,
            _ => panic!("Node is not a loop."),
        }
    }

    pub fn parent(&self, n: NodeID) -> Option<NodeID> {
        self.parents[n.idx()]
    }

    /// Nearest enclosing loop, skipping ifs and switches.
    pub fn parent_loop(&self, n: NodeID) -> Option<NodeID> {
        let mut iter = self.parent(n);
        while let Some(p) = iter {
            if self.is_loop(p) {
                return Some(p);
            }
            iter = self.parent(p);
        }
        None
    }

    pub fn parent_region(&self, n: NodeID) -> Option<NodeID> {
        let mut iter = Some(n);
        while let Some(p) = iter {
            if self.is_region(p) {
                return Some(p);
            }
            iter = self.parent(p);
        }
        None
    }

    /*
     * The container of a reference is the unit of graph validity tracking:
     * the nearest enclosing loop, or the root region for out-of-loop
     * references.
     */
    pub fn ref_container(&self, r: RefID) -> NodeID {
        let node = self.refs[r.idx()].node;
        match self.parent_loop(node) {
            Some(l) => l,
            None => self
                .parent_region(node)
                .expect("Reference's instruction is not inside a region."),
        }
    }

    /// Enclosing loops of a node, outermost first.
    pub fn enclosing_loops(&self, n: NodeID) -> Vec<NodeID> {
        let mut loops = vec![];
        let mut iter = if self.is_loop(n) { Some(n) } else { self.parent_loop(n) };
        while let Some(l) = iter {
            loops.push(l);
            iter = self.parent_loop(l);
        }
        loops.reverse();
        loops
    }

    /// Number of loops enclosing both references' instructions.
    pub fn common_nesting_depth(&self, a: RefID, b: RefID) -> u32 {
        let la = self.enclosing_loops(self.refs[a.idx()].node);
        let lb = self.enclosing_loops(self.refs[b.idx()].node);
        let mut depth = 0;
        for (x, y) in la.iter().zip(lb.iter()) {
            if x != y {
                break;
            }
            depth += 1;
        }
        depth
    }

    /// The loop at the given 1-based nesting level enclosing a node.
    pub fn loop_at_level(&self, n: NodeID, level: u32) -> Option<NodeID> {
        self.enclosing_loops(n)
            .into_iter()
            .find(|l| self.loop_level(*l) == level)
    }

    pub fn child_lists(&self, n: NodeID) -> Vec<&[NodeID]> {
        match &self.nodes[n.idx()] {
            Node::Region { children } | Node::Loop { children, .. } => vec![children.as_slice()],
            Node::If {
                then_children,
                else_children,
            } => vec![then_children.as_slice(), else_children.as_slice()],
            Node::Switch { cases } => cases.iter().map(|c| c.as_slice()).collect(),
            _ => vec![],
        }
    }

    /// Pre-order walk of a subtree, including the subtree root.
    pub fn subtree_nodes(&self, n: NodeID) -> Vec<NodeID> {
        let mut order = vec![];
        self.subtree_nodes_helper(n, &mut order);
        order
    }

    fn subtree_nodes_helper(&self, n: NodeID, order: &mut Vec<NodeID>) {
        order.push(n);
        // Snapshot the child lists before recursing so a mutating caller
        // cannot invalidate the traversal mid-walk.
        let children: Vec<NodeID> = self
            .child_lists(n)
            .into_iter()
            .flatten()
            .copied()
            .collect();
        for child in children {
            self.subtree_nodes_helper(child, order);
        }
    }

    pub fn descendant_loops(&self, n: NodeID) -> Vec<NodeID> {
        self.subtree_nodes(n)
            .into_iter()
            .filter(|m| *m != n && self.is_loop(*m))
            .collect()
    }

    pub fn is_innermost(&self, l: NodeID) -> bool {
        assert!(self.is_loop(l), "Innermost query on a non-loop node.");
        self.descendant_loops(l).is_empty()
    }

    /// All references in a subtree, blob sub-references included.
    pub fn subtree_refs(&self, n: NodeID) -> Vec<RefID> {
        let mut refs = vec![];
        for m in self.subtree_nodes(n) {
            if let Node::Inst { refs: inst_refs, .. } = &self.nodes[m.idx()] {
                for r in inst_refs {
                    refs.push(*r);
                    refs.extend_from_slice(self.refs[r.idx()].blob_refs());
                }
            }
        }
        refs
    }

    /*
     * Lexical order of every node, computed fresh by a pre-order walk of the
     * root regions. Node IDs themselves are creation-ordered, which stops
     * matching lexical order as soon as a transformation inserts nodes, so
     * consumers that care about program order recompute this.
     */
    pub fn lexical_order(&self) -> Vec<u32> {
        let mut order = vec![0; self.nodes.len()];
        let mut next = 0;
        for root in self.roots.iter() {
            for n in self.subtree_nodes(*root) {
                order[n.idx()] = next;
                next += 1;
            }
        }
        order
    }

    /// Rewrite a loop's bound expressions in place. Callers must follow up
    /// with `mark_loop_bounds_modified` on any live dependence analysis.
    pub fn set_loop_bounds(&mut self, l: NodeID, new_lower: CanonExpr, new_upper: CanonExpr, new_stride: i64) {
        match &mut self.nodes[l.idx()] {
            Node::Loop {
                lower,
                upper,
                stride,
                ..
            } => {
                *lower = new_lower;
                *upper = new_upper;
                *stride = new_stride;
            }
            _ => panic!("Node is not a loop."),
        }
    }

    pub fn loop_bounds(&self, l: NodeID) -> (&CanonExpr, &CanonExpr, i64) {
        match &self.nodes[l.idx()] {
            Node::Loop {
                lower,
                upper,
                stride,
                ..
            } => (lower, upper, *stride),
            _ => panic!("Node is not a loop."),
        }
    }

    /// Render a reference the way the textual format writes it.
    pub fn ref_string(&self, r: RefID) -> String {
        let ddref = &self.refs[r.idx()];
        let name = &self.symbol(ddref.symbase).name;
        match &ddref.kind {
            RefKind::Memory { subscripts, .. } => {
                let mut s = name.clone();
                for sub in subscripts {
                    s.push_str(&format!("[{}]", self.expr_string(sub)));
                }
                s
            }
            RefKind::Scalar | RefKind::Blob { .. } => format!("%{}", name),
        }
    }

    /// Render an expression with blob names resolved through the blob table.
    pub fn expr_string(&self, expr: &CanonExpr) -> String {
        let mut s = expr.to_string();
        // The Display impl writes blobs as %bN; swap in the source names.
        // Highest index first, so %b1 cannot clobber a %b1N occurrence.
        for (idx, symbase) in self.blobs.iter().enumerate().rev() {
            s = s.replace(
                &format!("%b{}", idx),
                &format!("%{}", self.symbol(*symbase).name),
            );
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_level_nest() -> (Function, NodeID, NodeID, NodeID) {
        let mut func = Function::new(String::from("nest"));
        let sym = func.intern_symbol("A", SymbolKind::Array);
        let inst = func.new_node(Node::Inst {
            op: InstOp::Assign,
            refs: vec![],
        });
        let r = func.new_ref(DDRef {
            node: inst,
            symbase: sym,
            is_lval: true,
            kind: RefKind::Memory {
                subscripts: vec![CanonExpr::from_iv(1, 1)],
                blobs: vec![],
            },
        });
        match &mut func.nodes[inst.idx()] {
            Node::Inst { refs, .. } => refs.push(r),
            _ => unreachable!(),
        }
        let inner = func.new_node(Node::Loop {
            level: 2,
            lower: CanonExpr::from_const(0),
            upper: CanonExpr::from_const(9),
            stride: 1,
            children: vec![inst],
        });
        let outer = func.new_node(Node::Loop {
            level: 1,
            lower: CanonExpr::from_const(0),
            upper: CanonExpr::from_const(9),
            stride: 1,
            children: vec![inner],
        });
        let region = func.new_node(Node::Region {
            children: vec![outer],
        });
        func.set_parent(inst, inner);
        func.set_parent(inner, outer);
        func.set_parent(outer, region);
        func.roots.push(region);
        (func, region, outer, inner)
    }

    #[test]
    fn parent_chain_queries() {
        let (func, region, outer, inner) = two_level_nest();
        let r = RefID::new(0);
        assert_eq!(func.ref_container(r), inner);
        assert_eq!(func.parent_loop(inner), Some(outer));
        assert_eq!(func.parent_region(outer), Some(region));
        assert_eq!(func.enclosing_loops(func.refs[0].node), vec![outer, inner]);
        assert_eq!(func.common_nesting_depth(r, r), 2);
        assert!(func.is_innermost(inner));
        assert!(!func.is_innermost(outer));
    }

    #[test]
    fn lexical_order_is_preorder() {
        let (func, region, outer, inner) = two_level_nest();
        let lex = func.lexical_order();
        assert!(lex[region.idx()] < lex[outer.idx()]);
        assert!(lex[outer.idx()] < lex[inner.idx()]);
        assert!(lex[inner.idx()] < lex[func.refs[0].node.idx()]);
    }

    #[test]
    fn subtree_refs_include_blobs() {
        let (mut func, _, _, inner) = two_level_nest();
        let t = func.intern_symbol("t", SymbolKind::Scalar);
        let inst = func.refs[0].node;
        let blob = func.new_ref(DDRef {
            node: inst,
            symbase: t,
            is_lval: false,
            kind: RefKind::Blob {
                parent: RefID::new(0),
            },
        });
        match &mut func.refs[0].kind {
            RefKind::Memory { blobs, .. } => blobs.push(blob),
            _ => unreachable!(),
        }
        assert_eq!(func.subtree_refs(inner), vec![RefID::new(0), blob]);
    }
}
