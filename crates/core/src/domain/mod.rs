pub mod dialogue;
pub mod execution;
pub mod pending;
pub mod slot;
pub mod template;
