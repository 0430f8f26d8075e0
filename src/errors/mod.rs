pub mod classifier;
pub mod stats;

pub use classifier::{classify, classify_with_context, ClassifiedError, ErrorCategory, ErrorSeverity};
pub use stats::{ClassifierSnapshot, ClassifierStats};
