//! Audio buffering primitives.

pub mod ring;

pub use ring::CircularAudioBuffer;
