mod reconcile;

pub use reconcile::{UnrecoverableCondition, run};
