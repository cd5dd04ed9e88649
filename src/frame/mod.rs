pub mod attrs;
pub mod codec;
pub mod ring;

pub use attrs::{CodeType, PerfAttrsWriter};
pub use ring::{frame_ring, FrameConsumer, FrameRing, FrameType, MAX_FRAME_HEADER_SIZE};
