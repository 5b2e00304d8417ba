//! The slot-filling pipeline: merge, repair, validate, ask.

pub mod canonical;
pub mod merger;
pub mod problems;
pub mod questions;
pub mod temporal;
pub mod validator;
