use anyhow::{Context, Result};
use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use clap::Parser;
use rand::rngs::OsRng;

/// Party-line operator account generator
///
/// Hashes a password with Argon2id and prints a ready to paste
/// `[[partyline.operators]]` entry for the rustsvcs configuration.
#[derive(Parser, Debug)]
#[command(
    name = "rustsvcs-mkpasswd",
    version,
    about = "Generate party-line operator entries for rustsvcs",
    long_about = "Hashes a password with Argon2id and prints a [[partyline.operators]] \
                  entry for the rustsvcs configuration file.\n\n\
                  The password is prompted for twice without echo unless it is piped \
                  in with --stdin."
)]
struct Cli {
    /// Operator login name
    #[arg(short, long, default_value = "admin")]
    name: String,

    /// Read the password from stdin instead of prompting
    #[arg(short, long)]
    stdin: bool,

    /// Print only the hash
    #[arg(short, long)]
    quiet: bool,
}

fn read_password(stdin: bool) -> Result<String> {
    if stdin {
        use std::io::Read;
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read password from stdin")?;
        return Ok(buffer.trim_end_matches(['\r', '\n']).to_string());
    }

    let first = rpassword::prompt_password("Password: ").context("Failed to read password")?;
    let second = rpassword::prompt_password("Again: ").context("Failed to read password")?;
    if first != second {
        anyhow::bail!("Passwords do not match");
    }
    Ok(first)
}

/// Hash a password and check the result verifies
fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Failed to hash password: {}", e))?
        .to_string();

    let parsed = PasswordHash::new(&hash).map_err(|e| anyhow::anyhow!("Unusable hash: {}", e))?;
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .map_err(|e| anyhow::anyhow!("Hash does not verify: {}", e))?;

    Ok(hash)
}

/// TOML entry for the configuration file
fn operator_entry(name: &str, hash: &str) -> String {
    format!(
        "[[partyline.operators]]\nname = \"{}\"\npassword_hash = \"{}\"\n",
        name, hash
    )
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.name.is_empty() || cli.name.contains(char::is_whitespace) {
        anyhow::bail!("Operator name must be a single word");
    }

    let password = read_password(cli.stdin)?;
    if password.is_empty() {
        anyhow::bail!("Password cannot be empty");
    }
    if password.len() < 8 {
        eprintln!("Warning: password is shorter than 8 characters");
    }

    let hash = hash_password(&password)?;
    if cli.quiet {
        println!("{}", hash);
        return Ok(());
    }

    println!("# Add to rustsvcs.toml, then log in on the party line with");
    println!("# .login {} <password>", cli.name);
    print!("{}", operator_entry(&cli.name, &hash));
    Ok(())
}
