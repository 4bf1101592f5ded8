//! Shared, process-agnostic utilities reused across the workspace's binaries.
//!
//! Trimmed down from the original `lib_common` to the two concerns the
//! collaboration hub actually needs: process/host identity (`utils::misc::sys_info`)
//! for startup banners and `/health`, and a resilient generic HTTP client
//! (`retrieve::ky_http`) for talking to the external application.

/// Generic, retrying HTTP client used for all outbound calls to the external app.
pub mod retrieve;
/// Process and host identity helpers.
pub mod utils;

pub use retrieve::ky_http::{ApiClient, ApiResponse};
pub use utils::misc::sys_info::{get_process_info, ProcessInfo, ProcessInfoError};
