pub mod manifest;
pub mod file;
pub mod command;
pub mod system;
pub mod checkpoint;
