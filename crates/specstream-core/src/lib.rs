pub mod analyzer;
pub mod broadcaster;
pub mod codec;
pub mod config;
pub mod detect;
pub mod dsp;
pub mod error;
pub mod frame;
pub mod history;
pub mod protocol;
pub mod stats;
pub mod synthetic;
pub mod util;
