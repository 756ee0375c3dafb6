pub mod asyncutil;
pub mod build_info;
pub mod cli;
pub mod config;
pub mod control;
pub mod cookie;
pub mod daemon;
pub mod display;
pub mod dmctl_cli;
pub mod events;
pub mod governor;
pub mod login;
pub mod mux;
pub mod proto;
pub mod server;
pub mod signals;
pub mod vt;
pub mod worker;
pub mod xauth;

pub fn main() -> anyhow::Result<()> {
    cli::run()
}
