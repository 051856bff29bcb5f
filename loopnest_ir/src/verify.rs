use crate::*;

/*
 * Structural verification for the IR and the dependence analysis. Returns
 * the first violation found as an error string. These are the invariants
 * the rest of the engine is allowed to assume; run this after parsing in
 * tests, or after a transformation when debugging invalidation bugs.
 */
pub fn verify_function(function: &Function) -> Result<(), String> {
    for (idx, _) in function.nodes.iter().enumerate() {
        let n = NodeID::new(idx);
        for list in function.child_lists(n) {
            for child in list {
                if function.parent(*child) != Some(n) {
                    Err(format!(
                        "Node {} lists child {} whose parent pointer disagrees.",
                        idx,
                        child.idx()
                    ))?;
                }
            }
        }
        if function.is_loop(n) {
            let expected = function.enclosing_loops(n).len() as u32;
            let level = function.loop_level(n);
            if level != expected {
                Err(format!(
                    "Loop {} has level {} but sits at depth {}.",
                    idx, level, expected
                ))?;
            }
        }
    }

    for (idx, ddref) in function.refs.iter().enumerate() {
        if !matches!(function.nodes[ddref.node.idx()], Node::Inst { .. }) {
            Err(format!(
                "Reference {} is owned by a non-instruction node.",
                idx
            ))?;
        }
        match &ddref.kind {
            RefKind::Blob { parent } => {
                let owner = function.ddref(*parent);
                if !owner.blob_refs().contains(&RefID::new(idx)) {
                    Err(format!(
                        "Blob reference {} is not listed by its parent.",
                        idx
                    ))?;
                }
                if ddref.is_lval {
                    Err(format!("Blob reference {} claims to be an lvalue.", idx))?;
                }
            }
            RefKind::Memory { blobs, .. } => {
                for blob in blobs {
                    match &function.ddref(*blob).kind {
                        RefKind::Blob { parent } if *parent == RefID::new(idx) => {}
                        _ => Err(format!(
                            "Memory reference {} lists a non-blob sub-reference.",
                            idx
                        ))?,
                    }
                }
            }
            RefKind::Scalar => {}
        }
    }
    Ok(())
}

pub fn verify_dd(function: &Function, dda: &DDAnalysis) -> Result<(), String> {
    // Dual-storage symmetry: every outgoing edge appears exactly once in
    // its sink's incoming list, and vice versa.
    for idx in 0..function.refs.len() {
        let r = RefID::new(idx);
        for edge in dda.graph.outgoing_edges(r) {
            if edge.src != r {
                Err(format!(
                    "Edge in outgoing list of reference {} has source {}.",
                    idx,
                    edge.src.idx()
                ))?;
            }
            let mirrored = dda
                .graph
                .incoming_edges(edge.sink)
                .iter()
                .filter(|e| *e == edge)
                .count();
            if mirrored != 1 {
                Err(format!(
                    "Edge {} appears {} times in its sink's incoming list.",
                    edge.print(function),
                    mirrored
                ))?;
            }
        }
        for edge in dda.graph.incoming_edges(r) {
            let mirrored = dda
                .graph
                .outgoing_edges(edge.src)
                .iter()
                .filter(|e| *e == edge)
                .count();
            if mirrored != 1 {
                Err(format!(
                    "Edge {} appears {} times in its source's outgoing list.",
                    edge.print(function),
                    mirrored
                ))?;
            }
        }
    }

    // Direction vectors stop at the common nesting depth of the endpoints.
    for idx in 0..function.refs.len() {
        for edge in dda.graph.outgoing_edges(RefID::new(idx)) {
            let common = function.common_nesting_depth(edge.src, edge.sink);
            if edge.dv.last_level() > common {
                Err(format!(
                    "Edge {} has direction entries below the common nesting depth {}.",
                    edge.print(function),
                    common
                ))?;
            }
        }
    }

    // Validity is tracked for loops and regions only.
    for node in dda.validation.keys() {
        if !function.is_loop(*node) && !function.is_region(*node) {
            Err(format!(
                "Validity tracked for node {} which is neither loop nor region.",
                node.idx()
            ))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsed_functions_verify() {
        let function = parse(
            "function @f {
               region {
                 do i1 = 0, 9, 1 {
                   A[i1 + %n] = A[i1];
                 }
               }
             }",
        )
        .unwrap();
        assert_eq!(verify_function(&function), Ok(()));
    }

    #[test]
    fn analysis_state_verifies_after_builds_and_marks() {
        let function = parse(
            "function @f {
               region {
                 do i1 = 0, 9, 1 {
                   A[i1] = A[i1 - 1];
                 }
               }
             }",
        )
        .unwrap();
        let region = function.roots[0];
        let l = function.descendant_loops(region)[0];
        let mut dda = DDAnalysis::new(AliasOracle::new());
        dda.get_graph(&function, region, false);
        assert_eq!(verify_dd(&function, &dda), Ok(()));
        dda.mark_loop_body_modified(&function, l);
        assert_eq!(verify_dd(&function, &dda), Ok(()));
        dda.get_graph(&function, l, false);
        assert_eq!(verify_dd(&function, &dda), Ok(()));
    }
}
