pub mod hyperliquid;
pub mod paper;
pub mod traits;
