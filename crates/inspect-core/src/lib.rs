pub mod check;
pub mod evaluator;
pub mod prometheus;
pub mod sanitize;
pub mod types;

pub use check::{Aggregate, CheckSpec, CommandCheck, CommandLine, CompareOp, PromqlCheck};
pub use evaluator::{evaluate, CheckContext};
pub use prometheus::{PromClient, Sample};
pub use types::*;
