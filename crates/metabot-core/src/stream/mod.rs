//! Agent event stream handling.
//!
//! The external agent writes newline-delimited JSON events. They are parsed
//! exactly once at the executor boundary into the tagged [`AgentEvent`]
//! enum, then folded by [`StreamProcessor`] into the [`CardState`] the chat
//! platforms render.

mod card;
mod events;
mod processor;

pub use card::{
    CardState, CardStatus, PendingQuestion, Question, QuestionOption, ToolCallEntry,
    ToolCallStatus,
};
pub use events::AgentEvent;
pub use processor::{extract_image_paths, StreamProcessor};
