//! Test fixtures for integration testing

pub mod capture;
pub mod room;

pub use capture::CaptureChannel;
pub use room::{RoomFixture, TestNode, fast_config};
