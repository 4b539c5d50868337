pub mod probe;
pub mod toolchain;

pub use probe::{AudioInfo, MediaInfo, VideoInfo};
pub use toolchain::{FfmpegToolchain, MediaToolchain};
