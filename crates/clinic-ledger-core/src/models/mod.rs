//! Domain models for the clinic ledger.

mod audit;
mod billing;
mod compensation;
mod fees;
mod patient;
mod refill;

pub use audit::*;
pub use billing::*;
pub use compensation::*;
pub use fees::*;
pub use patient::*;
pub use refill::*;
