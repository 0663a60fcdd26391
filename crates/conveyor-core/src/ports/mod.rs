//! Ports - replaceable collaborators (time, id generation).

pub mod clock;
pub mod id_generator;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, SequentialGenerator, UlidGenerator};
