pub mod client;
pub mod codec;
pub mod commands;
pub mod machine;
pub mod protocol;
