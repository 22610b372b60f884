pub mod events;
pub mod files;
pub mod instance;
pub mod server;
