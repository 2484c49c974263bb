pub mod events;
pub mod stream;
