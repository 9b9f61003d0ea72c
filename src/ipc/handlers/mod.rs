pub mod backup;
pub mod batches;
pub mod core;
pub mod payments;
pub mod roster;
