//! OAuth token management with storage and refresh capabilities.

mod manager;
mod storage;
mod tokens;

pub use manager::{AuthorizationRequest, Manager, TokenAccess, DEFAULT_REFRESH_MARGIN_SECONDS};
pub use storage::{MemoryStorage, Storage};
pub use tokens::{LinkState, LinkStatus, TokenSet};
