pub mod attr;
pub mod constants;
pub mod group;

pub use attr::PerfEventAttr;
pub use group::{
    AttrKeyTracker, EventGroup, EventRequest, GroupConfig, GroupError, GroupKind,
    PerfCapabilities, PerfEvent, RingBufferConfig, UNKNOWN_TRACEPOINT_ID,
};
