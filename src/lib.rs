//! `vexresched` as a library. See `src/bin` for the CLI entry point using it.

// Because this is a library, allow dead code to make in-class exercises easier
// to develop.
#![allow(dead_code)]

pub mod common;
pub mod config;
pub mod error;
pub mod front;
pub mod middle;
pub mod back;
