//! Embedded apps compiled into the binary

pub mod hello;
