pub mod collaborators;
pub mod dialogue;
pub mod errors;
pub mod ids;
pub mod record;
pub mod wire;

pub use collaborators::{CodeGenerator, Tutor, TutorAnswer};
pub use dialogue::{BlockReference, DialogueEntry, EntryBody, Role};
pub use errors::{GenerationError, TutorError, ValidationReason};
pub use ids::ConnectionId;
pub use record::{SessionRecord, SessionStats, Tutorial};
pub use wire::{ClientMessage, ControlRequest, ServerMessage};
