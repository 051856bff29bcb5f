pub mod alias;
pub mod dd;
pub mod ddgraph;
pub mod ddtest;
pub mod dot;
pub mod expr;
pub mod ir;
pub mod parse;
pub mod stats;
pub mod verify;

pub use crate::alias::*;
pub use crate::dd::*;
pub use crate::ddgraph::*;
pub use crate::ddtest::*;
pub use crate::dot::*;
pub use crate::expr::*;
pub use crate::ir::*;
pub use crate::parse::*;
pub use crate::stats::*;
pub use crate::verify::*;
