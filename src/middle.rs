//! The middle layer: register/instruction/bundle data model, the function
//! CFG and rewrite passes, and the intra-bundle packing graph.

pub mod bundle;
pub mod depgraph;
pub mod function;
pub mod instruction;
pub mod register;

pub use function::Function;
