//! Background runs — the persisted registry and the announce pipeline that
//! folds results back into the requesting conversation.

pub mod announce;
pub mod registry;

pub use announce::{AnnounceDone, AnnouncePipeline, ANNOUNCE_DEBOUNCE};
pub use registry::{
    CleanupMode, RegisterParams, SubagentOutcome, SubagentRegistry, SubagentRun,
    SUBAGENT_KEY_PREFIX,
};
