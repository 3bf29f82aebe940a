//! Live meeting sessions: who is connected to which room, and how their messages reach each other.

mod config;
mod envelope;
mod peer;
mod registry;
mod relay;
mod session;
mod util;

pub use config::*;
pub use envelope::*;
pub use peer::*;
pub use registry::*;
pub use relay::*;
pub use session::*;
pub use util::*;
