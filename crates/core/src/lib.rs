pub mod audit;
pub mod cache;
pub mod config;
pub mod dialogue;
pub mod domain;
pub mod errors;
pub mod templates;

pub use cache::{Cache, LruCache};
pub use dialogue::merger::{MergeOutcome, MergerConfig, SlotMerger};
pub use dialogue::problems::{ProblemDetector, ProblemDetectorConfig, ProblemReport};
pub use dialogue::questions::{Question, QuestionContext, QuestionGenerator, QuestionKind};
pub use dialogue::validator::{SlotValidator, ValidationCode, ValidationResult};
pub use domain::dialogue::{
    ActiveTask, ConflictStrategy, DialogueState, Extraction, TaskId, TaskStatus, UserId,
};
pub use domain::execution::{ActionRequest, ExecutionRecord, ExecutorOutcome};
pub use domain::pending::PendingState;
pub use domain::slot::SlotState;
pub use domain::template::SlotTemplate;
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use templates::{TemplateError, TemplateLoader};
