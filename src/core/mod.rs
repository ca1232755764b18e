pub mod clock;

pub use clock::{Clock, SystemClock, TestClock};
