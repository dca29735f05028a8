//! Core domain types and the broker error sum.

pub mod errors;
pub mod session;

pub use errors::{Error, Result};
pub use session::{
    AvailableGpu, ContainerEndpoint, Gpu, LaunchContext, Session, Viewer, ViewerPermission,
};
