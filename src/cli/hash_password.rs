//! The `hash-password` command: produce an admin password hash for
//! provisioning `HOMEGRAPH_ADMIN_PASSWORD_HASH`.

#![allow(clippy::print_stdout)]

use crate::config::HomeGraphConfig;
use crate::security::hash_password;
use crate::Result;

/// Hashes a password with the configured Argon2 parameters.
pub struct HashPasswordCommand {
    /// The password to hash. The complexity rules apply.
    pub password: String,
}

impl HashPasswordCommand {
    /// Prints the PHC hash string to stdout.
    pub fn execute(&self, config: &HomeGraphConfig) -> Result<()> {
        let hash = hash_password(&self.password, config.kdf)?;
        println!("{hash}");
        Ok(())
    }
}
