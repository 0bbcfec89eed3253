pub mod bootstrap;
pub mod ledger;
pub mod real;
pub mod stats;
pub mod tracer;
