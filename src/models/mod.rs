//! Data models for bars, positions, and session state.

mod bar;
mod position;
mod session;

pub use bar::PriceBar;
pub use position::Position;
pub use session::SessionState;
