//! Configuration for the tiller gateway.
//!
//! Discovery order: `./tiller.{toml,yaml,yml,json}` (project-local), then
//! `~/.config/tiller/`. String values support `${ENV_VAR}` substitution.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{config_dir, discover_and_load, load_config, set_config_dir},
    schema::TillerConfig,
};
