//! Side-effecting collaborators: files, model, tools, process sampling.

pub mod config;
pub mod conversation;
pub mod model;
pub mod probe;
pub mod prompt;
pub mod replay;
pub mod scope_file;
pub mod tools;
