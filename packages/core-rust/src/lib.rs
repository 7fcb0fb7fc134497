//! tiercache core: cache events, wire codec, type tags, and the monotonic clock.

pub mod clock;
pub mod codec;
pub mod event;
pub mod type_tag;

pub use clock::{process_clock, ClockSource, MonotonicClock, SystemClock};
pub use codec::{decode, encode, marshal_value, unmarshal_value, CodecError};
pub use event::{Event, Op};
pub use type_tag::TypeTag;
