use std::hash::Hash;

use rustc_hash::FxHashMap;

use crate::*;

/*
 * Qualitative per-level dependence direction. The discriminants are a bit
 * set: GT = 0x1, EQ = 0x2, LT = 0x4, so the union relations are the bitwise
 * ors of their members and ALL subsumes everything. UNINIT marks levels past
 * the deepest common nesting level of an edge's endpoints.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Direction {
    Uninit = 0,
    Gt = 1,
    Eq = 2,
    Ge = 3,
    Lt = 4,
    Lg = 5,
    Le = 6,
    All = 7,
}

impl Direction {
    pub fn from_bits(bits: u8) -> Self {
        match bits {
            0 => Direction::Uninit,
            1 => Direction::Gt,
            2 => Direction::Eq,
            3 => Direction::Ge,
            4 => Direction::Lt,
            5 => Direction::Lg,
            6 => Direction::Le,
            7 => Direction::All,
            _ => panic!("Direction bits out of range."),
        }
    }

    pub fn bits(self) -> u8 {
        self as u8
    }

    pub fn union(self, other: Direction) -> Direction {
        Direction::from_bits(self.bits() | other.bits())
    }

    pub fn includes(self, other: Direction) -> bool {
        self.bits() & other.bits() == other.bits()
    }

    /// True when more than one base relation is still possible, i.e. a
    /// demand-driven retest could tighten this level.
    pub fn is_union(self) -> bool {
        self.bits().count_ones() > 1
    }

    /// Mirror the relation, for reading an edge against its direction.
    pub fn reverse(self) -> Direction {
        let bits = self.bits();
        let swapped = (bits & 0x2) | ((bits & 0x1) << 2) | ((bits & 0x4) >> 2);
        Direction::from_bits(swapped)
    }

    pub fn glyph(self) -> &'static str {
        match self {
            Direction::Uninit => "0",
            Direction::Gt => ">",
            Direction::Eq => "=",
            Direction::Ge => ">=",
            Direction::Lt => "<",
            Direction::Lg => "<>",
            Direction::Le => "<=",
            Direction::All => "*",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirectionVector {
    elements: [Direction; MAX_LOOP_NEST_LEVEL],
}

impl DirectionVector {
    pub fn new() -> Self {
        DirectionVector {
            elements: [Direction::Uninit; MAX_LOOP_NEST_LEVEL],
        }
    }

    /// An input vector for the dependence test: EQ above `start`, ALL from
    /// `start` through `deepest`. This is the level-scoped query shape used
    /// by demand-driven refinement.
    pub fn input(start: u32, deepest: u32) -> Self {
        assert!(
            start >= 1 && start <= deepest && deepest as usize <= MAX_LOOP_NEST_LEVEL,
            "Bad refinement level range."
        );
        let mut dv = DirectionVector::new();
        for level in 1..start {
            dv.set_dv_at_level(Direction::Eq, level);
        }
        for level in start..=deepest {
            dv.set_dv_at_level(Direction::All, level);
        }
        dv
    }

    /// The unconstrained input vector: ALL at every level through `deepest`.
    pub fn all(deepest: u32) -> Self {
        if deepest == 0 {
            return DirectionVector::new();
        }
        DirectionVector::input(1, deepest)
    }

    pub fn dv_at_level(&self, level: u32) -> Direction {
        assert!(
            level >= 1 && level as usize <= MAX_LOOP_NEST_LEVEL,
            "DV level out of range."
        );
        self.elements[level as usize - 1]
    }

    pub fn set_dv_at_level(&mut self, dir: Direction, level: u32) {
        assert!(
            level >= 1 && level as usize <= MAX_LOOP_NEST_LEVEL,
            "DV level out of range."
        );
        self.elements[level as usize - 1] = dir;
    }

    /// Deepest initialized level, or 0 for an empty vector.
    pub fn last_level(&self) -> u32 {
        for level in (1..=MAX_LOOP_NEST_LEVEL as u32).rev() {
            if self.dv_at_level(level) != Direction::Uninit {
                return level;
            }
        }
        0
    }

    /// Outermost level whose direction excludes EQ. A dependence with such a
    /// level is carried there and cannot occur in a single iteration of any
    /// deeper loop.
    pub fn leading_non_eq(&self) -> Option<u32> {
        for level in 1..=self.last_level() {
            if !self.dv_at_level(level).includes(Direction::Eq) {
                return Some(level);
            }
        }
        None
    }

    /// True when the dependence can occur with all loops above `level` in
    /// the same iteration, which is what scoping a graph to a loop assumes
    /// for the enclosing levels.
    pub fn eq_possible_above(&self, level: u32) -> bool {
        for l in 1..level {
            let dir = self.dv_at_level(l);
            if dir != Direction::Uninit && !dir.includes(Direction::Eq) {
                return false;
            }
        }
        true
    }
}

impl Default for DirectionVector {
    fn default() -> Self {
        DirectionVector::new()
    }
}

impl std::fmt::Display for DirectionVector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[ ")?;
        for level in 1..=self.last_level() {
            write!(f, "{} ", self.dv_at_level(level).glyph())?;
        }
        write!(f, "]")
    }
}

/*
 * Quantitative companion to the direction vector: a per-level iteration
 * distance when the test can derive one, None where it cannot.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DistanceVector {
    elements: [Option<i64>; MAX_LOOP_NEST_LEVEL],
}

impl DistanceVector {
    pub fn new() -> Self {
        DistanceVector {
            elements: [None; MAX_LOOP_NEST_LEVEL],
        }
    }

    pub fn dist_at_level(&self, level: u32) -> Option<i64> {
        assert!(
            level >= 1 && level as usize <= MAX_LOOP_NEST_LEVEL,
            "Distance level out of range."
        );
        self.elements[level as usize - 1]
    }

    pub fn set_dist_at_level(&mut self, dist: i64, level: u32) {
        assert!(
            level >= 1 && level as usize <= MAX_LOOP_NEST_LEVEL,
            "Distance level out of range."
        );
        self.elements[level as usize - 1] = Some(dist);
    }

    pub fn print(&self, last_level: u32) -> String {
        let mut s = String::from("( ");
        for level in 1..=last_level {
            match self.dist_at_level(level) {
                Some(d) => s.push_str(&format!("{} ", d)),
                None => s.push_str("? "),
            }
        }
        s.push(')');
        s
    }
}

impl Default for DistanceVector {
    fn default() -> Self {
        DistanceVector::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepType {
    Output,
    Input,
    Anti,
    Flow,
}

impl std::fmt::Display for DepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DepType::Output => "OUTPUT",
            DepType::Input => "INPUT",
            DepType::Anti => "ANTI",
            DepType::Flow => "FLOW",
        };
        write!(f, "{}", s)
    }
}

/*
 * A dependence edge between two references. Value typed: the owning graph
 * stores each edge twice, once per adjacency list, so edges must stay cheap
 * to clone and must not carry shared mutable state.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DDEdge {
    pub src: RefID,
    pub sink: RefID,
    pub dv: DirectionVector,
    pub dist: DistanceVector,
}

impl DDEdge {
    pub fn new(src: RefID, sink: RefID, dv: DirectionVector, dist: DistanceVector) -> Self {
        DDEdge {
            src,
            sink,
            dv,
            dist,
        }
    }

    /*
     * The dependence kind is a pure function of the endpoints' current
     * lvalue roles, recomputed on every call. Nothing is cached here: if a
     * transformation flips a reference's role, the next query sees it.
     */
    pub fn edge_type(&self, function: &Function) -> DepType {
        let src_is_lval = function.ddref(self.src).is_lval;
        let sink_is_lval = function.ddref(self.sink).is_lval;
        match (src_is_lval, sink_is_lval) {
            (true, true) => DepType::Output,
            (true, false) => DepType::Flow,
            (false, true) => DepType::Anti,
            (false, false) => DepType::Input,
        }
    }

    pub fn dv_at_level(&self, level: u32) -> Direction {
        self.dv.dv_at_level(level)
    }

    pub fn print(&self, function: &Function) -> String {
        format!(
            "{}:{} {} --> {} {} {}",
            function.ddref(self.src).node.idx(),
            function.ddref(self.sink).node.idx(),
            function.ref_string(self.src),
            function.ref_string(self.sink),
            self.edge_type(function),
            self.dv
        )
    }
}

/*
 * Generic owning graph focused on fast iteration at the cost of slow
 * modification and extra memory: every edge is stored as a value twice,
 * once in the source's outgoing list and once in the sink's incoming list.
 * Clients can add edges and iterate them; there is no public removal.
 */
pub trait GraphEdge<N> {
    fn src(&self) -> N;
    fn sink(&self) -> N;
}

impl GraphEdge<RefID> for DDEdge {
    fn src(&self) -> RefID {
        self.src
    }

    fn sink(&self) -> RefID {
        self.sink
    }
}

#[derive(Debug, Clone)]
pub struct HIRGraph<N, E> {
    in_edges: FxHashMap<N, Vec<E>>,
    out_edges: FxHashMap<N, Vec<E>>,
}

impl<N: Copy + Eq + Hash, E: Clone + GraphEdge<N>> HIRGraph<N, E> {
    pub fn new() -> Self {
        HIRGraph {
            in_edges: FxHashMap::default(),
            out_edges: FxHashMap::default(),
        }
    }

    pub fn add_edge(&mut self, e: E) {
        self.in_edges.entry(e.sink()).or_default().push(e.clone());
        self.out_edges.entry(e.src()).or_default().push(e);
    }

    pub fn incoming_edges(&self, n: N) -> &[E] {
        self.in_edges.get(&n).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn outgoing_edges(&self, n: N) -> &[E] {
        self.out_edges.get(&n).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn nodes_with_outgoing(&self) -> impl Iterator<Item = N> + '_ {
        self.out_edges.keys().copied()
    }

    pub fn num_edges(&self) -> usize {
        self.out_edges.values().map(|v| v.len()).sum()
    }

    pub fn clear(&mut self) {
        self.in_edges.clear();
        self.out_edges.clear();
    }

    /*
     * Drop every edge incident to a node matched by the predicate, from both
     * adjacency maps. This is deliberately not part of the public contract -
     * only the analysis uses it, to evict a stale scope's edges before
     * re-testing that scope.
     */
    pub(crate) fn purge_nodes<F: Fn(N) -> bool>(&mut self, stale: F) {
        self.in_edges.retain(|n, _| !stale(*n));
        self.out_edges.retain(|n, _| !stale(*n));
        for edges in self.in_edges.values_mut() {
            edges.retain(|e| !stale(e.src()) && !stale(e.sink()));
        }
        for edges in self.out_edges.values_mut() {
            edges.retain(|e| !stale(e.src()) && !stale(e.sink()));
        }
    }
}

impl<N: Copy + Eq + Hash, E: Clone + GraphEdge<N>> Default for HIRGraph<N, E> {
    fn default() -> Self {
        HIRGraph::new()
    }
}

/// The function-wide dependence graph: references for nodes, dependence
/// edges between them.
pub type DDGraphTy = HIRGraph<RefID, DDEdge>;

/*
 * Read-only, level-aware projection over the function graph, scoped to one
 * region or loop. For a loop at level L every enclosing level is assumed to
 * sit in the same iteration, so edges that cannot take EQ at some level
 * above L are hidden - they are carried by an outer loop and do not
 * constrain this one. INPUT (read/read) edges are hidden unless requested.
 *
 * The view borrows the analysis that produced it, so the borrow checker
 * rejects any attempt to invalidate or rebuild the graph while a view is
 * live.
 *
 * Note: edges are not filtered to keep both endpoints inside the scoping
 * node's subtree. Some edges may point at references outside the region of
 * interest; callers that care must filter.
 */
#[derive(Clone, Copy)]
pub struct DDGraph<'a> {
    graph: &'a DDGraphTy,
    function: &'a Function,
    node: NodeID,
    level: u32,
    input_edges: bool,
}

impl<'a> DDGraph<'a> {
    pub(crate) fn new(
        graph: &'a DDGraphTy,
        function: &'a Function,
        node: NodeID,
        level: u32,
        input_edges: bool,
    ) -> Self {
        DDGraph {
            graph,
            function,
            node,
            level,
            input_edges,
        }
    }

    pub fn scope(&self) -> NodeID {
        self.node
    }

    /// 1-based level of the scoping loop; 0 for a region scope.
    pub fn level(&self) -> u32 {
        self.level
    }

    fn edge_visible(&self, e: &DDEdge) -> bool {
        if !self.input_edges && e.edge_type(self.function) == DepType::Input {
            return false;
        }
        self.level == 0 || e.dv.eq_possible_above(self.level)
    }

    pub fn outgoing_edges(&self, r: RefID) -> impl Iterator<Item = &'a DDEdge> + '_ {
        self.graph
            .outgoing_edges(r)
            .iter()
            .filter(move |e| self.edge_visible(e))
    }

    pub fn incoming_edges(&self, r: RefID) -> impl Iterator<Item = &'a DDEdge> + '_ {
        self.graph
            .incoming_edges(r)
            .iter()
            .filter(move |e| self.edge_visible(e))
    }

    /// All visible edges in the scope, one occurrence each (via the
    /// outgoing lists).
    pub fn edges(&self) -> impl Iterator<Item = &'a DDEdge> + '_ {
        self.graph
            .out_edges
            .values()
            .flatten()
            .filter(move |e| self.edge_visible(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_bit_algebra() {
        assert_eq!(Direction::Lt.union(Direction::Eq), Direction::Le);
        assert_eq!(Direction::Lt.union(Direction::Gt), Direction::Lg);
        assert!(Direction::All.includes(Direction::Eq));
        assert!(!Direction::Lt.includes(Direction::Eq));
        assert!(Direction::Le.is_union());
        assert!(!Direction::Eq.is_union());
        assert_eq!(Direction::Lt.reverse(), Direction::Gt);
        assert_eq!(Direction::Le.reverse(), Direction::Ge);
        assert_eq!(Direction::All.reverse(), Direction::All);
    }

    #[test]
    fn dv_printing_truncates_trailing_uninit() {
        let mut dv = DirectionVector::new();
        dv.set_dv_at_level(Direction::Lt, 1);
        dv.set_dv_at_level(Direction::All, 2);
        assert_eq!(dv.to_string(), "[ < * ]");
        assert_eq!(dv.last_level(), 2);
        assert_eq!(DirectionVector::new().to_string(), "[ ]");
    }

    #[test]
    fn input_vector_shape() {
        let dv = DirectionVector::input(3, 5);
        assert_eq!(dv.dv_at_level(1), Direction::Eq);
        assert_eq!(dv.dv_at_level(2), Direction::Eq);
        assert_eq!(dv.dv_at_level(3), Direction::All);
        assert_eq!(dv.dv_at_level(5), Direction::All);
        assert_eq!(dv.dv_at_level(6), Direction::Uninit);
    }

    #[test]
    fn graph_stores_edges_twice() {
        let mut graph: DDGraphTy = HIRGraph::new();
        let a = RefID::new(0);
        let b = RefID::new(1);
        let e = DDEdge::new(a, b, DirectionVector::new(), DistanceVector::new());
        graph.add_edge(e.clone());
        assert_eq!(graph.outgoing_edges(a), &[e.clone()]);
        assert_eq!(graph.incoming_edges(b), &[e]);
        assert!(graph.outgoing_edges(b).is_empty());
        assert!(graph.incoming_edges(a).is_empty());
        assert_eq!(graph.num_edges(), 1);
    }

    #[test]
    fn purge_removes_mirrored_copies() {
        let mut graph: DDGraphTy = HIRGraph::new();
        let a = RefID::new(0);
        let b = RefID::new(1);
        let c = RefID::new(2);
        graph.add_edge(DDEdge::new(a, b, DirectionVector::new(), DistanceVector::new()));
        graph.add_edge(DDEdge::new(b, c, DirectionVector::new(), DistanceVector::new()));
        graph.purge_nodes(|n| n == a);
        assert!(graph.outgoing_edges(a).is_empty());
        assert!(graph.incoming_edges(b).is_empty());
        assert_eq!(graph.outgoing_edges(b).len(), 1);
        assert_eq!(graph.incoming_edges(c).len(), 1);
    }
}
