//! Password hashing utility
//!
//! Prints an Argon2id hash for seeding an admin account by hand.
//!
//! Usage:
//!   cargo run --bin hash-password
//!   cargo run --bin hash-password "MySecurePassword123"

use std::env;
use std::io::{self, Write};

use studio_api::auth::{hash_password, validate_password_strength};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let password = if let Some(pwd) = env::args().nth(1) {
        pwd
    } else {
        // Reading from stdin keeps the password out of the process list
        print!("Enter password to hash: ");
        io::stdout().flush()?;

        let mut password = String::new();
        io::stdin().read_line(&mut password)?;
        password.trim().to_string()
    };

    if let Err(e) = validate_password_strength(&password) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    let password_hash = hash_password(&password)?;

    println!("\n===========================================");
    println!("Password Hash (Argon2id):");
    println!("===========================================");
    println!("{}", password_hash);
    println!("===========================================\n");

    println!("Example SQL:");
    println!(
        "UPDATE users SET password_hash = '{}', role = 'admin' WHERE email = 'owner@example.com';",
        password_hash
    );

    Ok(())
}
