//! `scuttle` entrypoint.
//!
//! Usage: `scuttle <command> [args...]`. Behaviour is configured through environment
//! variables, see [`scuttle_rs::config`].

use std::process;

use scuttle_rs::run::run;

#[tokio::main]
async fn main() {
    match run().await {
        Ok(exit_code) => process::exit(exit_code),
        Err(e) => {
            eprintln!("scuttle: {e}");
            process::exit(e.exit_code())
        }
    }
}
