//! Node store backends.

pub mod mem;
