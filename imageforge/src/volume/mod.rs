//! Storage volume preparation.

mod preparation;

pub use preparation::{PreparedVolume, VolumePreparationContext};
