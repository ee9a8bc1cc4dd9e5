use crate::cli::run;

pub mod artwork;
pub mod cli;
pub mod config;
pub mod domain;
pub mod http;
pub mod notify;
pub mod pipeline;
pub mod source;

fn main() -> anyhow::Result<()> {
    run()
}
