pub mod cli;
pub mod load_config;
pub mod release_dir;

pub use cli::{run, Cli, Commands, Target};
