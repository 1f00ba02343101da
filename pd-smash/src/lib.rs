pub mod address;
pub mod code_buffer;
pub mod error;
pub mod listing;
#[cfg(feature = "cli")]
pub mod logging;
pub mod smashable;

pub use address::CodeAddress;
pub use code_buffer::{CodeBuffer, CodeBufferConfig, Protection};
pub use error::{SmashError, SmashResult};
pub use listing::format_sequence;
pub use smashable::{
    AArch64, ConditionCode, DefaultBackend, SLOT_SIZE, SmashKind, SmashableBackend,
};
