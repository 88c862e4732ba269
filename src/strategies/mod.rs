pub mod funding_premium;
pub mod gate;
pub mod rotation;
pub mod traits;
