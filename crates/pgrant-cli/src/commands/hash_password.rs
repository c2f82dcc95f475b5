//! `pgrant hash-password`: produce an Argon2 PHC string for `users`.

use std::io::{self, BufRead, IsTerminal, Write};

use anyhow::{anyhow, bail, Result};

pub fn run(password: Option<String>) -> Result<()> {
    let password = match password {
        Some(password) => password,
        None => read_password(io::stdin().lock())?,
    };
    if password.is_empty() {
        bail!("password must not be empty");
    }

    let hash = pgrant_proxy::hash_password(&password)
        .map_err(|e| anyhow!("failed to hash password: {}", e))?;
    println!("{}", hash);
    Ok(())
}

/// First line of `input`, without its line ending.
fn read_password(mut input: impl BufRead) -> Result<String> {
    if io::stdin().is_terminal() {
        eprint!("Password: ");
        io::stderr().flush()?;
    }
    let mut line = String::new();
    input.read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
