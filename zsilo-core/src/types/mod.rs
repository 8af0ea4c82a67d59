//! Domain types.

pub mod volume;

pub use volume::{Volume, VolumeMode, VolumeOption, VolumeStatus};
