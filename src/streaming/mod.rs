//! Stream relay: admission, live session tracking and forced stop

pub mod http_stream;
pub mod management;
pub mod registry;
pub mod session_manager;

pub use management::{LocalManagementPlane, ManagementPlane, RemoteManagementPlane};
pub use registry::{SessionInfo, SessionRegistry};
pub use session_manager::{StreamClient, StreamSessionManager, StreamStartError};
