//! Outbound adapters: worker signals, async completions, payload resolution.

pub mod completion;
pub mod notifier;
pub mod payload;

pub use completion::{Completion, CompletionChannel, HttpCompletionChannel, MemoryCompletionChannel};
pub use notifier::{BroadcastNotifier, Notifier, Signal};
pub use payload::{PassthroughPayloadResolver, PayloadResolver};
