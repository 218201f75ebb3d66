//! Sample containers and the spectral estimators applied to them.
pub mod block;
pub mod fft;
pub mod welch;

pub use block::SampleBlock;
