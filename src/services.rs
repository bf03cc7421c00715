pub mod host;
pub mod tasks;
pub mod ups;
