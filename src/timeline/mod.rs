pub mod chunk;
pub mod codec;
pub mod decimate;
pub mod sample;
