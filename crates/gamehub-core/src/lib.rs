pub mod debug;
pub mod protocol;
