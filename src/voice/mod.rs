//! Spoken commands: time extraction, command parsing, and the listener loop.

pub mod command;
pub mod extractor;
pub mod listener;
