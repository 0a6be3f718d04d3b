//! Time abstraction shared by the store and its tests.

mod clock;

pub use clock::{Clock, MockClock, SystemClock};
