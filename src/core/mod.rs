pub mod engine;
pub mod guard;
pub mod hedge;
pub mod reconcile;
