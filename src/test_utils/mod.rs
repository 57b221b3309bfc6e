//! Test doubles shared by the unit tests of this crate.

pub mod mock;
