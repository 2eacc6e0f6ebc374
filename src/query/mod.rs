pub mod ast;
pub mod parser;
pub mod schema;

pub use ast::{Comparison, Operator, Query};
pub use parser::QueryParser;
