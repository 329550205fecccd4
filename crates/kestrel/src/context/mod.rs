//! Context window management.
//!
//! Keeps each iteration's message list inside the model's budget. All passes
//! work on the in-memory copy of the conversation; the stored history is
//! never rewritten.
//!
//! 1. **[`budget`]**: character-based token estimates and thresholds.
//! 2. **[`micro`]**: continuous trimming of large tool results from
//!    file/shell/web tools, every iteration.
//! 3. **[`pruning`]**: soft trim then hard clear of old tool results once the
//!    estimate passes a fraction of the budget.
//! 4. **[`images`]**: inline images the model already answered are replaced by
//!    a placeholder.
//! 5. **[`file_tracker`]** and **[`summarizer`]**: what compaction needs to
//!    stay useful afterwards.

pub mod budget;
pub mod file_tracker;
pub mod images;
pub mod micro;
pub mod pruning;
pub mod summarizer;

pub use budget::{CHARS_PER_TOKEN, ContextBudget, estimate_message, estimate_messages};
pub use file_tracker::{FileAccessTracker, ReinjectionConfig};
pub use micro::{MicroCompactConfig, MicroReport, micro_compact};
pub use pruning::{PruneReport, PruningConfig, prune};
