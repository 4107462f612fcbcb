//! Network host: accepts connections and runs one session per connection.

pub mod registry;
pub mod server;
pub mod session;

pub use registry::SessionRegistry;
pub use server::Host;
pub use session::{SessionHandle, SessionInfo, SessionState};
