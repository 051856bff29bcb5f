extern crate loopnest_ir;
extern crate petgraph;

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use rustc_hash::FxHashMap;

use self::loopnest_ir::*;

/*
 * Loop distribution preprocessing. To discover pi blocks we start from the
 * dependence graph of the loop to distribute and reduce it to a much
 * smaller chunk graph before running SCC analysis. Each chunk is a piece of
 * the body distribution cannot split: a single statement, or an entire
 * inner loop, if or switch together with everything inside it. There is
 * one DistPPEdge per chunk pair, standing for the whole list of underlying
 * dependence edges, and unlike the per-reference graph this one is allowed
 * to contain cycles - every cycle becomes a pi block, a group that must
 * stay together in one of the distributed loops.
 *
 * Chunks are created by a lexical walk, so chunk IDs are in program order.
 * Because the innermost loop was the distribution candidate before any
 * outer loop, an inner loop appearing as a single chunk here means clients
 * should process loops innermost to outermost.
 */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkID(u32);

impl ChunkID {
    pub fn new(x: usize) -> Self {
        ChunkID(x as u32)
    }

    pub fn idx(&self) -> usize {
        self.0 as usize
    }
}

/// One indivisible piece of the loop body, identified by its top node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistPPNode {
    pub node: NodeID,
}

/// A coalesced edge between two chunks carrying the underlying dependence
/// edges it stands for. Immutable once added to the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct DistPPEdge {
    pub src: ChunkID,
    pub sink: ChunkID,
    pub dd_edges: Vec<DDEdge>,
}

impl GraphEdge<ChunkID> for DistPPEdge {
    fn src(&self) -> ChunkID {
        self.src
    }

    fn sink(&self) -> ChunkID {
        self.sink
    }
}

/// A maximal strongly connected group of chunks: the unit loop
/// distribution is allowed to move around but never split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PiBlock {
    pub chunks: Vec<ChunkID>,
}

#[derive(Debug, Clone)]
pub struct DistPPGraph {
    loop_node: NodeID,
    level: u32,
    chunks: Vec<DistPPNode>,
    chunk_of: FxHashMap<NodeID, ChunkID>,
    graph: HIRGraph<ChunkID, DistPPEdge>,
    failure: Option<String>,
}

impl DistPPGraph {
    /*
     * Build the preprocessing graph for one loop. Unsupported constructs do
     * not panic: the graph comes back flagged invalid with a readable
     * reason, and the caller declines the transformation.
     */
    pub fn build(function: &Function, loop_node: NodeID, dda: &mut DDAnalysis) -> DistPPGraph {
        assert!(
            function.is_loop(loop_node),
            "Distribution preprocessing is per-loop."
        );
        let mut graph = DistPPGraph {
            loop_node,
            level: function.loop_level(loop_node),
            chunks: vec![],
            chunk_of: FxHashMap::default(),
            graph: HIRGraph::new(),
            failure: None,
        };

        let stats = dda.loop_stats(function, loop_node);
        if stats.num_calls > 0 {
            graph.set_invalid("cannot distribute loops with calls");
            return graph;
        }
        if stats.has_control_flow {
            graph.set_invalid("cannot distribute graph with control flow");
            return graph;
        }

        graph.create_chunks(function);
        graph.create_edges(function, dda);
        graph
    }

    pub fn is_graph_valid(&self) -> bool {
        self.failure.is_none()
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn set_invalid(&mut self, reason: &str) {
        tracing::debug!(
            loop_node = self.loop_node.idx(),
            reason,
            "distribution preprocessing bailed"
        );
        self.failure = Some(reason.to_string());
    }

    pub fn node_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunks(&self) -> &[DistPPNode] {
        &self.chunks
    }

    pub fn chunk_of(&self, node: NodeID) -> Option<ChunkID> {
        self.chunk_of.get(&node).copied()
    }

    pub fn outgoing_edges(&self, chunk: ChunkID) -> &[DistPPEdge] {
        self.graph.outgoing_edges(chunk)
    }

    pub fn incoming_edges(&self, chunk: ChunkID) -> &[DistPPEdge] {
        self.graph.incoming_edges(chunk)
    }

    /// Every immediate child of the loop starts a chunk; the chunk claims
    /// the child's whole subtree, so references anywhere below map to it.
    fn create_chunks(&mut self, function: &Function) {
        let children: Vec<NodeID> = function.child_lists(self.loop_node)[0].to_vec();
        for child in children {
            let chunk = ChunkID::new(self.chunks.len());
            self.chunks.push(DistPPNode { node: child });
            for n in function.subtree_nodes(child) {
                self.chunk_of.insert(n, chunk);
            }
        }
    }

    fn create_edges(&mut self, function: &Function, dda: &mut DDAnalysis) {
        let lex = function.lexical_order();
        let mut edge_map: FxHashMap<(ChunkID, ChunkID), Vec<DDEdge>> = FxHashMap::default();
        {
            let view = dda.get_graph(function, self.loop_node, false);
            for r in function.subtree_refs(self.loop_node) {
                for edge in view.outgoing_edges(r) {
                    // Edges leaving the loop nest constrain nothing the
                    // distribution of this body can break.
                    let sink_node = function.ddref(edge.sink).node;
                    let sink_chunk = match self.chunk_of.get(&sink_node) {
                        Some(chunk) => *chunk,
                        None => continue,
                    };
                    let src_chunk = self.chunk_of[&function.ddref(edge.src).node];
                    if src_chunk == sink_chunk {
                        continue;
                    }
                    edge_map
                        .entry((src_chunk, sink_chunk))
                        .or_default()
                        .push(edge.clone());
                }
            }
        }

        let mut pairs: Vec<((ChunkID, ChunkID), Vec<DDEdge>)> = edge_map.into_iter().collect();
        pairs.sort_by_key(|(key, _)| *key);
        for ((src, sink), dd_edges) in pairs {
            let backward = dd_edges
                .iter()
                .any(|edge| need_backward_edge(function, &lex, edge, self.level));
            self.graph.add_edge(DistPPEdge {
                src,
                sink,
                dd_edges: dd_edges.clone(),
            });
            if backward {
                self.graph.add_edge(DistPPEdge {
                    src: sink,
                    sink: src,
                    dd_edges,
                });
            }
        }
    }

    /*
     * SCC discovery over the chunk graph. On an invalid graph this returns
     * no blocks rather than analyzing a partially built graph; callers are
     * expected to have checked is_graph_valid already.
     */
    pub fn pi_blocks(&self) -> Vec<PiBlock> {
        if !self.is_graph_valid() {
            return vec![];
        }
        let mut scc_graph: DiGraph<ChunkID, ()> = DiGraph::new();
        for idx in 0..self.chunks.len() {
            scc_graph.add_node(ChunkID::new(idx));
        }
        for idx in 0..self.chunks.len() {
            for edge in self.graph.outgoing_edges(ChunkID::new(idx)) {
                scc_graph.add_edge(
                    NodeIndex::new(edge.src.idx()),
                    NodeIndex::new(edge.sink.idx()),
                    (),
                );
            }
        }
        let mut blocks: Vec<PiBlock> = tarjan_scc(&scc_graph)
            .into_iter()
            .map(|scc| {
                let mut chunks: Vec<ChunkID> =
                    scc.into_iter().map(|ix| ChunkID::new(ix.index())).collect();
                chunks.sort();
                PiBlock { chunks }
            })
            .collect();
        // Chunk IDs are lexical, so this orders blocks in program order.
        blocks.sort_by_key(|block| block.chunks[0]);
        blocks
    }
}

/*
 * The per-reference graph keeps a single edge for some dependences where
 * SCC formation needs both directions to see the cycle: a loop-independent
 * scalar flow (t = ...; ... = t), a scalar output dependence stored as a
 * single * edge, and memory edges with <= whose source does not lexically
 * precede the sink. Without the forced reverse edge distribution would
 * happily order the sink's chunk before the source's:
 *
 *   do i = 1, 50
 *     A[100 - 2 * i] = ...
 *     A[50 - i] = ...
 *
 * has an output <= from the second statement to the first.
 */
fn need_backward_edge(
    function: &Function,
    lex: &[u32],
    edge: &DDEdge,
    level: u32,
) -> bool {
    let src = function.ddref(edge.src);
    let sink = function.ddref(edge.sink);
    let dir = edge.dv_at_level(level);

    if src.is_terminal() && sink.is_terminal() && dir == Direction::Eq {
        return true;
    }
    if src.is_terminal() && edge.edge_type(function) == DepType::Output && dir == Direction::All {
        return true;
    }
    if src.is_memory() && dir == Direction::Le && lex[src.node.idx()] > lex[sink.node.idx()] {
        return true;
    }
    false
}
