pub mod codec;
pub mod commands;
pub mod reply;
