use rustc_hash::FxHashMap;

use crate::*;

/*
 * Whole-subtree summary for one loop. "Self" counts would be the direct
 * children only; everything here is total over the subtree, which is what
 * the dependence engine's clients ask about.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopStats {
    pub num_insts: u32,
    pub num_calls: u32,
    pub num_ifs: u32,
    pub num_switches: u32,
    pub has_control_flow: bool,
    pub is_innermost: bool,
}

/*
 * Lazily computed, cached per-loop statistics. The cache is invalidated
 * wholesale whenever a client declares a modification; the recompute is a
 * single subtree walk, so no finer granularity is worth the bookkeeping.
 */
#[derive(Debug, Clone, Default)]
pub struct LoopStatistics {
    cache: FxHashMap<NodeID, LoopStats>,
}

impl LoopStatistics {
    pub fn new() -> Self {
        LoopStatistics {
            cache: FxHashMap::default(),
        }
    }

    pub fn loop_stats(&mut self, function: &Function, node: NodeID) -> LoopStats {
        assert!(
            function.is_loop(node) || function.is_region(node),
            "Statistics are tracked for loops and regions only."
        );
        if let Some(stats) = self.cache.get(&node) {
            return *stats;
        }
        let mut stats = LoopStats {
            num_insts: 0,
            num_calls: 0,
            num_ifs: 0,
            num_switches: 0,
            has_control_flow: false,
            is_innermost: true,
        };
        for n in function.subtree_nodes(node) {
            match &function.nodes[n.idx()] {
                Node::Inst { op, .. } => {
                    stats.num_insts += 1;
                    if let InstOp::Call { .. } = op {
                        stats.num_calls += 1;
                    }
                }
                Node::If { .. } => stats.num_ifs += 1,
                Node::Switch { .. } => stats.num_switches += 1,
                Node::Label { .. } | Node::Goto { .. } => stats.has_control_flow = true,
                Node::Loop { .. } => {
                    if n != node {
                        stats.is_innermost = false;
                    }
                }
                Node::Region { .. } => {}
            }
        }
        self.cache.insert(node, stats);
        stats
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_over_parsed_nest() {
        let mut func = parse(
            "function @f {
               region {
                 do i1 = 0, 9, 1 {
                   do i2 = 0, 9, 1 {
                     A[i1][i2] = B[i1][i2];
                   }
                   call helper(A[i1][0]);
                 }
               }
             }",
        )
        .unwrap();
        let region = func.roots[0];
        let outer = func.subtree_nodes(region)[1];
        let inner = func.descendant_loops(outer)[0];
        let mut stats = LoopStatistics::new();
        let outer_stats = stats.loop_stats(&mut func, outer);
        assert_eq!(outer_stats.num_insts, 2);
        assert_eq!(outer_stats.num_calls, 1);
        assert!(!outer_stats.is_innermost);
        let inner_stats = stats.loop_stats(&mut func, inner);
        assert_eq!(inner_stats.num_insts, 1);
        assert_eq!(inner_stats.num_calls, 0);
        assert!(inner_stats.is_innermost);
    }
}
