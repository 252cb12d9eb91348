//! Rule compilation and nftables programming for gateway firewall tables.

pub mod compiler;
pub mod expr;
pub mod program;
pub mod render;
pub mod ruleset;

pub use compiler::*;
pub use expr::*;
pub use program::*;
pub use render::*;
pub use ruleset::*;
