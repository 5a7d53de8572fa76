use anyhow::{bail, Result};
use clap::Parser;
use std::io::{self, BufRead};

use stac_ingestor::auth::hash_password;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Print the password_sha256 value for an auth.users entry"
)]
struct Args {
    /// Password to hash; read from the first line of stdin when omitted
    password: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let password = match args.password {
        Some(p) => p,
        None => {
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line)?;
            line.trim_end_matches(['\r', '\n']).to_string()
        }
    };
    if password.is_empty() {
        bail!("password must not be empty");
    }
    println!("{}", hash_password(&password));
    Ok(())
}
