/// Mining shares module
///
/// Per-submission validation against the job registry

pub mod validator;

pub use validator::{is_low_difficulty, Share, ShareExtras, ShareState, ShareSummary};
