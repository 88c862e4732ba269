pub mod state;

pub use state::{StateLoad, StateStore};
