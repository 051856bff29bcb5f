extern crate clap;
extern crate loopnest_ir;
extern crate loopnest_opt;

use std::fs::File;
use std::io::prelude::*;

use clap::Parser;

use loopnest_ir::*;
use loopnest_opt::*;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    hir_file: String,

    #[arg(short, long, default_value_t = String::new())]
    output: String,

    /// Also print the distribution pi blocks for every innermost loop.
    #[arg(long)]
    pi_blocks: bool,
}

fn main() {
    let args = Args::parse();
    if !args.hir_file.ends_with(".hir") {
        eprintln!("WARNING: Running loopnest_dot on a file without a .hir extension - interpreting as a textual loop-nest HIR file.");
    }

    let mut file = File::open(&args.hir_file).expect("PANIC: Unable to open input file.");
    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .expect("PANIC: Unable to read input file contents.");
    let function = parse(&contents).expect("PANIC: Failed to parse loop-nest HIR file.");
    verify_function(&function).expect("PANIC: Parsed HIR failed verification.");

    let mut dda = DDAnalysis::new(AliasOracle::new());
    let mut dot = String::new();
    {
        let view = dda.get_graph(&function, function.roots[0], false);
        write_dot(&function, &view, &mut dot).expect("PANIC: Unable to render dot output.");
    }

    if args.output.is_empty() {
        print!("{}", dot);
    } else {
        let mut file = File::create(&args.output).expect("PANIC: Unable to open output file.");
        file.write_all(dot.as_bytes())
            .expect("PANIC: Unable to write output file contents.");
    }

    if args.pi_blocks {
        let region = function.roots[0];
        for l in function.descendant_loops(region) {
            if !function.is_innermost(l) {
                continue;
            }
            let graph = DistPPGraph::build(&function, l, &mut dda);
            if !graph.is_graph_valid() {
                println!(
                    "loop {}: not distributable ({})",
                    l.idx(),
                    graph.failure_reason().unwrap_or("unknown")
                );
                continue;
            }
            let blocks = graph.pi_blocks();
            println!("loop {}: {} pi blocks", l.idx(), blocks.len());
            for (idx, block) in blocks.iter().enumerate() {
                let nodes: Vec<usize> = block
                    .chunks
                    .iter()
                    .map(|c| graph.chunks()[c.idx()].node.idx())
                    .collect();
                println!("  pi block {}: nodes {:?}", idx, nodes);
            }
        }
    }
}
