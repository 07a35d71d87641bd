//! Update Renderer
//!
//! Turns a stream of agent output into a small number of chat messages that
//! are edited in place as the turn progresses.

mod buffer;
pub mod markup;
mod target;

pub use buffer::{Part, RenderBuffer};
pub use target::{RenderTarget, RenderUpdate, TerminalMark, ToolEvent, UpdateRenderer};
