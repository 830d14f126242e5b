//! Image artifacts.
//!
//! - [`squashfs`] - build a SquashFS image from an entry source
//! - [`filesystem`] - partial-file handling so only complete images land
//!   at their destination

pub mod filesystem;
pub mod squashfs;
