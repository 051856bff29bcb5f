use crate::*;

/*
 * The dependence test. Given an ordered pair of references and an input
 * direction vector constraining which per-level relations are even worth
 * asking about, enumerate the direction-vector hierarchy over the common
 * nesting levels and keep the assignments that survive a per-dimension
 * feasibility check (interval bounds from constant loop bounds, plus a GCD
 * divisibility test). Anything the test cannot reason about - symbolic
 * bounds that do not cancel, blob terms that differ, mismatched dimension
 * counts - degrades to "all directions possible" rather than failing; a
 * missed optimization beats a miscompile.
 *
 * Two query shapes share the machinery:
 *  - `test_refs` normalizes results into graph edges on the lexically
 *    ordered pair, flipping backward assignments (leading >) into a
 *    reversed edge with mirrored directions.
 *  - `test_refs_raw` returns the un-normalized union for the pair as given,
 *    which is what demand-driven refinement wants, and reports independence
 *    as None.
 */

/// One common level's contribution to a subscript difference, in iteration
/// space (coefficients are already multiplied by the loop strides, constant
/// lower bounds already folded into the dimension constant).
#[derive(Debug, Clone, Copy)]
struct LevelTerm {
    a: i64,
    b: i64,
    na: Option<i64>,
    nb: Option<i64>,
}

/// A term from a level deeper than the common nest, present on only one
/// side of the difference. The sign of `c` carries the side.
#[derive(Debug, Clone, Copy)]
struct ExtraTerm {
    c: i64,
    n: Option<i64>,
}

#[derive(Debug, Clone)]
struct DimEq {
    levels: Vec<LevelTerm>,
    extra: Vec<ExtraTerm>,
    c: i64,
    unknown: bool,
}

#[derive(Debug, Clone)]
struct PairContext {
    common: u32,
    dims: Vec<DimEq>,
    comparable: bool,
    never_executes: bool,
}

/*
 * Interval with open ends. None on a side means unbounded in that
 * direction; Empty means the constraint set itself is empty (e.g. a strict
 * relation inside a single-trip loop), which refutes the whole assignment.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ival {
    Empty,
    Range(Option<i64>, Option<i64>),
}

impl Ival {
    fn point(x: i64) -> Self {
        Ival::Range(Some(x), Some(x))
    }

    fn unbounded() -> Self {
        Ival::Range(None, None)
    }

    fn add(self, other: Ival) -> Ival {
        match (self, other) {
            (Ival::Empty, _) | (_, Ival::Empty) => Ival::Empty,
            (Ival::Range(lo1, hi1), Ival::Range(lo2, hi2)) => {
                let lo = match (lo1, lo2) {
                    (Some(x), Some(y)) => Some(x.saturating_add(y)),
                    _ => None,
                };
                let hi = match (hi1, hi2) {
                    (Some(x), Some(y)) => Some(x.saturating_add(y)),
                    _ => None,
                };
                Ival::Range(lo, hi)
            }
        }
    }

    fn contains_zero(self) -> bool {
        match self {
            Ival::Empty => false,
            Ival::Range(lo, hi) => lo.map_or(true, |x| x <= 0) && hi.map_or(true, |x| x >= 0),
        }
    }
}

fn gcd(a: i64, b: i64) -> i64 {
    let (mut a, mut b) = (a.abs(), b.abs());
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

fn trip_count(lower: &CanonExpr, upper: &CanonExpr, stride: i64) -> Option<i64> {
    match (lower.as_const(), upper.as_const()) {
        (Some(lb), Some(ub)) => {
            if ub < lb {
                Some(0)
            } else {
                Some((ub - lb) / stride + 1)
            }
        }
        _ => None,
    }
}

fn build_context(
    function: &Function,
    src: RefID,
    sink: RefID,
    common_override: Option<u32>,
) -> PairContext {
    let common = common_override.unwrap_or_else(|| function.common_nesting_depth(src, sink));
    let src_ref = function.ddref(src);
    let sink_ref = function.ddref(sink);

    let mut ctx = PairContext {
        common,
        dims: vec![],
        comparable: true,
        never_executes: false,
    };

    // Terminal references have no subscripts to compare; the symbase match
    // was already established by the pruning predicate, so every direction
    // the input admits stays possible.
    if src_ref.is_terminal() || sink_ref.is_terminal() {
        ctx.comparable = false;
        return ctx;
    }

    let src_subs = src_ref.subscripts();
    let sink_subs = sink_ref.subscripts();
    if src_subs.len() != sink_subs.len() {
        ctx.comparable = false;
        return ctx;
    }

    let src_loops = function.enclosing_loops(src_ref.node);
    let sink_loops = function.enclosing_loops(sink_ref.node);

    for (ss, ks) in src_subs.iter().zip(sink_subs.iter()) {
        let mut dim = DimEq {
            levels: vec![],
            extra: vec![],
            c: ss.constant() - ks.constant(),
            unknown: false,
        };

        // Differing symbolic parts leave an unknown offset in the
        // difference. Blob operands are treated as loop invariant here; the
        // blob's own def-use edges in the graph cover redefinition.
        if ss.blob_coeffs() != ks.blob_coeffs() {
            dim.unknown = true;
        }

        for level in 1..=common {
            let a_iv = ss.iv_coeff(level);
            let b_iv = ks.iv_coeff(level);
            let src_loop = src_loops.get(level as usize - 1).copied();
            let sink_loop = sink_loops.get(level as usize - 1).copied();
            let (term, zero_trip) =
                level_term(function, a_iv, b_iv, src_loop, sink_loop, &mut dim);
            if zero_trip {
                ctx.never_executes = true;
            }
            dim.levels.push(term);
        }

        // Levels below the common nest appear on a single side each.
        for level in common + 1..=MAX_LOOP_NEST_LEVEL as u32 {
            extra_term(function, ss.iv_coeff(level), src_loops.get(level as usize - 1).copied(), 1, &mut dim, &mut ctx.never_executes);
            extra_term(function, ks.iv_coeff(level), sink_loops.get(level as usize - 1).copied(), -1, &mut dim, &mut ctx.never_executes);
        }

        ctx.dims.push(dim);
    }
    ctx
}

fn level_term(
    function: &Function,
    a_iv: i64,
    b_iv: i64,
    src_loop: Option<NodeID>,
    sink_loop: Option<NodeID>,
    dim: &mut DimEq,
) -> (LevelTerm, bool) {
    let mut zero_trip = false;
    let mut side = |loop_id: Option<NodeID>, coeff: i64| -> (i64, Option<i64>, Option<i64>) {
        match loop_id {
            Some(l) => {
                let (lower, upper, stride) = function.loop_bounds(l);
                let n = trip_count(lower, upper, stride);
                if n == Some(0) {
                    zero_trip = true;
                }
                let fold = lower.as_const().map(|lb| coeff * lb);
                (coeff * stride, n, fold)
            }
            None => (coeff, None, if coeff == 0 { Some(0) } else { None }),
        }
    };
    let (a, na, fold_a) = side(src_loop, a_iv);
    let (b, nb, fold_b) = side(sink_loop, b_iv);

    let term = LevelTerm { a, b, na, nb };
    match (fold_a, fold_b) {
        // Constant lower bounds shift the difference by a known amount;
        // fold the shift into the dimension constant so the level terms can
        // work in zero-based iteration space.
        (Some(fa), Some(fb)) => dim.c += fa - fb,
        _ => {
            // A symbolic lower bound cancels out of the difference exactly
            // when both sides run the same loop (or textually equal bounds)
            // with equal coefficients.
            let same_base = src_loop.is_some() && src_loop == sink_loop;
            let same_bounds = match (src_loop, sink_loop) {
                (Some(x), Some(y)) => {
                    function.loop_bounds(x).0 == function.loop_bounds(y).0
                }
                _ => false,
            };
            if !((same_base || same_bounds) && a_iv == b_iv) {
                dim.unknown = true;
            }
        }
    }
    (term, zero_trip)
}

fn extra_term(
    function: &Function,
    coeff: i64,
    loop_id: Option<NodeID>,
    sign: i64,
    dim: &mut DimEq,
    never_executes: &mut bool,
) {
    if coeff == 0 {
        return;
    }
    match loop_id {
        Some(l) => {
            let (lower, upper, stride) = function.loop_bounds(l);
            let n = trip_count(lower, upper, stride);
            if n == Some(0) {
                *never_executes = true;
            }
            match lower.as_const() {
                Some(lb) => dim.c += sign * coeff * lb,
                None => dim.unknown = true,
            }
            dim.extra.push(ExtraTerm {
                c: sign * coeff * stride,
                n,
            });
        }
        None => dim.unknown = true,
    }
}

/*
 * Interval of a*x - b*y over {0 <= x < na, 0 <= y < nb, x REL y}. Strict
 * relations inside a loop too short to provide two distinct iterations make
 * the constraint set empty, which is how narrowed bounds kill dependences.
 */
fn level_interval(rel: Direction, t: &LevelTerm) -> Ival {
    let LevelTerm { a, b, na, nb } = *t;
    match rel {
        Direction::Eq => {
            if a == b {
                return Ival::point(0);
            }
            let n = match (na, nb) {
                (Some(x), Some(y)) => Some(x.min(y)),
                (Some(x), None) | (None, Some(x)) => Some(x),
                _ => None,
            };
            match n {
                Some(n) if n < 1 => Ival::Empty,
                Some(n) => {
                    let end = (a - b).saturating_mul(n - 1);
                    Ival::Range(Some(end.min(0)), Some(end.max(0)))
                }
                None => {
                    if a > b {
                        Ival::Range(Some(0), None)
                    } else {
                        Ival::Range(None, Some(0))
                    }
                }
            }
        }
        Direction::Lt => strict_interval(a, b, na, nb),
        Direction::Gt => {
            // x > y is x' < y' with the sides swapped and the result negated.
            match strict_interval(b, a, nb, na) {
                Ival::Empty => Ival::Empty,
                Ival::Range(lo, hi) => {
                    Ival::Range(hi.map(|x| -x), lo.map(|x| -x))
                }
            }
        }
        _ => panic!("Assignments use base relations only."),
    }
}

fn strict_interval(a: i64, b: i64, na: Option<i64>, nb: Option<i64>) -> Ival {
    // Feasibility of x < y at all: y needs at least its second iteration.
    if let Some(ny) = nb {
        if ny < 2 {
            return Ival::Empty;
        }
    }
    if let Some(nx) = na {
        if nx < 1 {
            return Ival::Empty;
        }
    }
    match (na, nb) {
        (Some(nx), Some(ny)) => {
            let xmax = nx - 1;
            let ymax = ny - 1;
            let mut lo = i64::MAX;
            let mut hi = i64::MIN;
            for x in [0, xmax.min(ymax - 1)] {
                for y in [x + 1, ymax] {
                    if x >= 0 && x <= xmax && y > x && y <= ymax {
                        let v = a.saturating_mul(x).saturating_sub(b.saturating_mul(y));
                        lo = lo.min(v);
                        hi = hi.max(v);
                    }
                }
            }
            Ival::Range(Some(lo), Some(hi))
        }
        _ => {
            if a == 0 && b == 0 {
                Ival::point(0)
            } else if a == b {
                // a*(x - y) with x - y <= -1.
                if a > 0 {
                    Ival::Range(None, Some(-a))
                } else {
                    Ival::Range(Some(-a), None)
                }
            } else {
                Ival::unbounded()
            }
        }
    }
}

fn extra_interval(t: &ExtraTerm) -> Ival {
    match t.n {
        Some(n) if n < 1 => Ival::Empty,
        Some(n) => {
            let end = t.c.saturating_mul(n - 1);
            Ival::Range(Some(end.min(0)), Some(end.max(0)))
        }
        None => {
            if t.c == 0 {
                Ival::point(0)
            } else if t.c > 0 {
                Ival::Range(Some(0), None)
            } else {
                Ival::Range(None, Some(0))
            }
        }
    }
}

fn assignment_feasible(ctx: &PairContext, assignment: &[Direction]) -> bool {
    if !ctx.comparable {
        return true;
    }
    for dim in ctx.dims.iter() {
        if dim.unknown {
            continue;
        }
        let mut ival = Ival::point(dim.c);
        for (term, rel) in dim.levels.iter().zip(assignment.iter()) {
            ival = ival.add(level_interval(*rel, term));
        }
        for term in dim.extra.iter() {
            ival = ival.add(extra_interval(term));
        }
        if !ival.contains_zero() {
            return false;
        }

        let mut g = 0;
        for (term, rel) in dim.levels.iter().zip(assignment.iter()) {
            if *rel == Direction::Eq {
                g = gcd(g, term.a - term.b);
            } else {
                g = gcd(g, term.a);
                g = gcd(g, term.b);
            }
        }
        for term in dim.extra.iter() {
            g = gcd(g, term.c);
        }
        if g > 0 && dim.c % g != 0 {
            return false;
        }
    }
    true
}

fn feasible_assignments(ctx: &PairContext, input_dv: &DirectionVector) -> Vec<Vec<Direction>> {
    if ctx.never_executes {
        return vec![];
    }
    let allowed: Vec<u8> = (1..=ctx.common)
        .map(|level| {
            let bits = input_dv.dv_at_level(level).bits();
            if bits == 0 {
                Direction::All.bits()
            } else {
                bits
            }
        })
        .collect();

    let mut found = vec![];
    let mut assignment = vec![Direction::Eq; ctx.common as usize];
    explore(ctx, &allowed, 0, &mut assignment, &mut found);
    found
}

fn explore(
    ctx: &PairContext,
    allowed: &[u8],
    level: usize,
    assignment: &mut Vec<Direction>,
    found: &mut Vec<Vec<Direction>>,
) {
    if level == allowed.len() {
        if assignment_feasible(ctx, assignment) {
            found.push(assignment.clone());
        }
        return;
    }
    for rel in [Direction::Lt, Direction::Eq, Direction::Gt] {
        if allowed[level] & rel.bits() != 0 {
            assignment[level] = rel;
            explore(ctx, allowed, level + 1, assignment, found);
        }
    }
}

/// Per-level iteration distance when a dimension pins the level down
/// exactly (strong SIV: the level is the only one appearing in the
/// dimension, equal coefficients, nothing symbolic).
fn strong_siv_distance(ctx: &PairContext, level: u32) -> Option<i64> {
    if !ctx.comparable {
        return None;
    }
    let mut result = None;
    for dim in ctx.dims.iter() {
        if dim.unknown || !dim.extra.is_empty() {
            continue;
        }
        let term = &dim.levels[level as usize - 1];
        if term.a != term.b || term.a == 0 {
            continue;
        }
        let only_level = dim
            .levels
            .iter()
            .enumerate()
            .all(|(idx, t)| idx == level as usize - 1 || (t.a == 0 && t.b == 0));
        if !only_level {
            continue;
        }
        if dim.c % term.a != 0 {
            return None;
        }
        let d = dim.c / term.a;
        match result {
            None => result = Some(d),
            Some(prev) if prev == d => {}
            // Two dimensions demanding different distances at the same
            // level means no dependence; the feasibility check already
            // refuted it, so just decline a distance here.
            Some(_) => return None,
        }
    }
    result
}

/*
 * Graph-building query: test the lexically ordered pair and produce zero,
 * one or two edges. Assignments whose leading non-EQ relation is GT are
 * realized sink-to-source, so they flip into a reversed edge with mirrored
 * per-level directions; all-EQ assignments are loop independent and stay on
 * the forward edge (callers pass references in lexical execution order).
 */
pub fn test_refs(
    function: &Function,
    src: RefID,
    sink: RefID,
    input_dv: &DirectionVector,
) -> Vec<DDEdge> {
    // Scalar and blob references get the single-edge shapes the rest of
    // the engine expects: a loop-independent (all =) flow/anti edge for a
    // def/use pair, an all-* edge for an output pair. Consumers that need
    // the reverse ordering constraint reconstruct it themselves.
    let src_ref = function.ddref(src);
    let sink_ref = function.ddref(sink);
    if src_ref.is_terminal() || sink_ref.is_terminal() {
        let common = function.common_nesting_depth(src, sink);
        let dir = if src_ref.is_lval && sink_ref.is_lval {
            Direction::All
        } else {
            Direction::Eq
        };
        let mut dv = DirectionVector::new();
        for level in 1..=common {
            dv.set_dv_at_level(dir, level);
        }
        return vec![DDEdge::new(src, sink, dv, DistanceVector::new())];
    }

    let ctx = build_context(function, src, sink, None);
    let assignments = feasible_assignments(&ctx, input_dv);

    let mut forward = [0u8; MAX_LOOP_NEST_LEVEL];
    let mut backward = [0u8; MAX_LOOP_NEST_LEVEL];
    let mut has_forward = false;
    let mut has_backward = false;

    for assignment in assignments.iter() {
        let leading = assignment
            .iter()
            .position(|rel| *rel != Direction::Eq);
        match leading {
            None => {
                // Same-iteration self access is not a dependence.
                if src == sink {
                    continue;
                }
                has_forward = true;
                for (idx, rel) in assignment.iter().enumerate() {
                    forward[idx] |= rel.bits();
                }
            }
            Some(idx) if assignment[idx] == Direction::Lt => {
                has_forward = true;
                for (idx, rel) in assignment.iter().enumerate() {
                    forward[idx] |= rel.bits();
                }
            }
            Some(_) if src == sink => {
                // On a self pair the flipped edge is the same edge; fold
                // the mirrored directions forward instead of duplicating.
                has_forward = true;
                for (idx, rel) in assignment.iter().enumerate() {
                    forward[idx] |= rel.reverse().bits();
                }
            }
            Some(_) => {
                has_backward = true;
                for (idx, rel) in assignment.iter().enumerate() {
                    backward[idx] |= rel.reverse().bits();
                }
            }
        }
    }

    let mut edges = vec![];
    if has_forward {
        edges.push(make_edge(&ctx, src, sink, &forward, 1));
    }
    if has_backward {
        edges.push(make_edge(&ctx, sink, src, &backward, -1));
    }
    edges
}

fn make_edge(
    ctx: &PairContext,
    src: RefID,
    sink: RefID,
    bits: &[u8; MAX_LOOP_NEST_LEVEL],
    dist_sign: i64,
) -> DDEdge {
    let mut dv = DirectionVector::new();
    let mut dist = DistanceVector::new();
    for level in 1..=ctx.common {
        dv.set_dv_at_level(Direction::from_bits(bits[level as usize - 1]), level);
        if let Some(d) = strong_siv_distance(ctx, level) {
            dist.set_dist_at_level(dist_sign * d, level);
        }
    }
    DDEdge::new(src, sink, dv, dist)
}

/*
 * Demand-driven query: the un-normalized union of every surviving relation
 * on the pair exactly as given, or None when the pair is provably
 * independent under the input vector. `for_fusion` analyzes both references
 * as if they sat together at `deepest_level`, for fusion legality tests on
 * sibling loop bodies.
 */
pub fn test_refs_raw(
    function: &Function,
    src: RefID,
    sink: RefID,
    input_dv: &DirectionVector,
    deepest_level: u32,
    for_fusion: bool,
) -> Option<(DirectionVector, DistanceVector)> {
    let common_override = if for_fusion { Some(deepest_level) } else { None };
    let ctx = build_context(function, src, sink, common_override);
    let assignments = feasible_assignments(&ctx, input_dv);
    if assignments.is_empty() {
        return None;
    }

    let mut bits = [0u8; MAX_LOOP_NEST_LEVEL];
    for assignment in assignments.iter() {
        for (idx, rel) in assignment.iter().enumerate() {
            bits[idx] |= rel.bits();
        }
    }
    let mut dv = DirectionVector::new();
    let mut dist = DistanceVector::new();
    for level in 1..=ctx.common {
        dv.set_dv_at_level(Direction::from_bits(bits[level as usize - 1]), level);
        if let Some(d) = strong_siv_distance(&ctx, level) {
            dist.set_dist_at_level(d, level);
        }
    }
    Some((dv, dist))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two-deep nest with the classic pair from the bounds-invalidation
    /// example: a[i][j] and a[i+1][4].
    fn nest(j_upper: i64) -> (Function, RefID, RefID) {
        let text = format!(
            "function @f {{
               region {{
                 do i1 = 0, 99, 1 {{
                   do i2 = 1, {}, 1 {{
                     A[i1][i2] = 1;
                     A[i1 + 1][4] = 2;
                   }}
                 }}
               }}
             }}",
            j_upper
        );
        let func = parse(&text).unwrap();
        (func, RefID::new(0), RefID::new(1))
    }

    #[test]
    fn carried_by_outer_loop() {
        let (func, w1, w2) = nest(99);
        let dv_all = DirectionVector::all(2);
        let edges = test_refs(&func, w1, w2, &dv_all);
        // The equal-location constraint i = i' + 1 realizes sink-to-source:
        // one backward edge, carried at level 1 with distance 1.
        assert_eq!(edges.len(), 1);
        let edge = &edges[0];
        assert_eq!(edge.src, w2);
        assert_eq!(edge.sink, w1);
        assert_eq!(edge.dv_at_level(1), Direction::Lt);
        assert_eq!(edge.dist.dist_at_level(1), Some(1));
        assert_eq!(edge.edge_type(&func), DepType::Output);
    }

    #[test]
    fn narrowed_inner_bounds_prove_independence() {
        let (func, w1, w2) = nest(1);
        // With i2 pinned to the single value 1, the second subscripts are 1
        // and 4: no overlap at any direction.
        let dv_all = DirectionVector::all(2);
        assert!(test_refs(&func, w1, w2, &dv_all).is_empty());
        assert!(test_refs_raw(&func, w1, w2, &dv_all, 2, false).is_none());
    }

    #[test]
    fn flow_distance_one() {
        let func = parse(
            "function @f {
               region {
                 do i1 = 0, 49, 1 {
                   A[i1] = 1;
                   B[i1] = A[i1 - 1];
                 }
               }
             }",
        )
        .unwrap();
        let write = RefID::new(0);
        let read = RefID::new(2);
        let edges = test_refs(&func, write, read, &DirectionVector::all(1));
        assert_eq!(edges.len(), 1);
        let edge = &edges[0];
        assert_eq!((edge.src, edge.sink), (write, read));
        assert_eq!(edge.edge_type(&func), DepType::Flow);
        assert_eq!(edge.dv_at_level(1), Direction::Lt);
        assert_eq!(edge.dist.dist_at_level(1), Some(1));
    }

    #[test]
    fn gcd_refutes_odd_even() {
        let func = parse(
            "function @f {
               region {
                 do i1 = 0, 99, 1 {
                   A[2 * i1] = 1;
                   B[0] = A[2 * i1 + 1];
                 }
               }
             }",
        )
        .unwrap();
        let write = RefID::new(0);
        let read = RefID::new(2);
        assert!(test_refs(&func, write, read, &DirectionVector::all(1)).is_empty());
    }

    #[test]
    fn same_location_writes() {
        let func = parse(
            "function @f {
               region {
                 do i1 = 0, 9, 1 {
                   A[4] = 1;
                   A[4] = 2;
                 }
               }
             }",
        )
        .unwrap();
        let w1 = RefID::new(0);
        let w2 = RefID::new(1);
        let edges = test_refs(&func, w1, w2, &DirectionVector::all(1));
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0].dv_at_level(1), Direction::Le);
        assert_eq!((edges[0].src, edges[0].sink), (w1, w2));
        assert_eq!(edges[1].dv_at_level(1), Direction::Lt);
        assert_eq!((edges[1].src, edges[1].sink), (w2, w1));
    }

    #[test]
    fn refinement_union_is_raw() {
        let (func, w1, w2) = nest(99);
        // Unconstrained raw union on the ordered pair keeps the > at the
        // outer level rather than flipping the edge.
        let (dv, dist) = test_refs_raw(&func, w1, w2, &DirectionVector::all(2), 2, false).unwrap();
        assert_eq!(dv.dv_at_level(1), Direction::Gt);
        assert_eq!(dist.dist_at_level(1), Some(-1));
        // Constraining level 1 to EQ removes every solution.
        let eq_then_all = DirectionVector::input(2, 2);
        assert!(test_refs_raw(&func, w1, w2, &eq_then_all, 2, false).is_none());
    }
}
