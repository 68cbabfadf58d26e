pub mod batch;
pub mod key;

pub use batch::{CallFact, DeclarationFact, FactBatch, OverrideFact, Resolution};
pub use key::FunctionKey;
