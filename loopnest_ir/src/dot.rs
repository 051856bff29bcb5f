use rustc_hash::FxHashMap;

use crate::*;

/*
 * Graphviz rendering of a dependence graph view. References become nodes
 * labeled with their instruction number and textual form; edges carry the
 * dependence kind and direction vector. Anti and input edges are dashed so
 * the ordering-relevant flow/output edges stand out.
 */
pub fn write_dot<W: std::fmt::Write>(
    function: &Function,
    view: &DDGraph,
    w: &mut W,
) -> std::fmt::Result {
    write!(w, "digraph \"{}\" {{\n", function.name)?;
    write!(w, "label=\"@{}\"\n", function.name)?;

    let mut names: FxHashMap<RefID, String> = FxHashMap::default();
    let declare = |r: RefID, w: &mut W, names: &mut FxHashMap<RefID, String>| {
        if names.contains_key(&r) {
            return Ok(());
        }
        let name = format!("ref_{}", r.idx());
        let label = format!(
            "{}: {}",
            function.ddref(r).node.idx(),
            function.ref_string(r)
        );
        write!(w, "{} [label=\"{}\"];\n", name, escape(&label))?;
        names.insert(r, name);
        Ok(())
    };

    let mut edges: Vec<&DDEdge> = view.edges().collect();
    edges.sort_by_key(|e| (e.src, e.sink));
    for edge in edges {
        declare(edge.src, w, &mut names)?;
        declare(edge.sink, w, &mut names)?;
        let style = match edge.edge_type(function) {
            DepType::Flow | DepType::Output => "solid",
            DepType::Anti | DepType::Input => "dashed",
        };
        write!(
            w,
            "{} -> {} [label=\"{} {}\", style=\"{}\"];\n",
            names[&edge.src],
            names[&edge.sink],
            edge.edge_type(function),
            escape(&edge.dv.to_string()),
            style
        )?;
    }
    write!(w, "}}\n")?;
    Ok(())
}

fn escape(s: &str) -> String {
    s.replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_edges_with_direction_labels() {
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
        let mut dda = DDAnalysis::new(AliasOracle::new());
        let mut out = String::new();
        let view = dda.get_graph(&function, region, false);
        write_dot(&function, &view, &mut out).unwrap();
        assert!(out.starts_with("digraph"));
        assert!(out.contains("FLOW"));
        assert!(out.contains("[ < ]"));
        assert!(out.contains("A[i1 - 1]"));
    }
}
