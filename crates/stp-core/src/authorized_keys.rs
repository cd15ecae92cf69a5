//! `authorized_keys` maintenance
//!
//! After login the client appends the broker's public key to the local
//! `authorized_keys` file so the operator can reach the exposed SSH
//! service with the same key pair the tunnel uses.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// Append `public_key` to the file at `path` unless an identical line exists.
///
/// Lines are compared after trimming surrounding whitespace. The file (and
/// its parent directory) is created when missing. Returns `true` if the key
/// was appended and `false` if it was already present.
pub fn add_authorized_key(path: &Path, public_key: &str) -> io::Result<bool> {
    let key = public_key.trim();
    if key.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "public key is empty",
        ));
    }

    let existing = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            String::new()
        }
        Err(e) => return Err(e),
    };

    if existing.lines().any(|line| line.trim() == key) {
        tracing::debug!("Public key already authorized in {}", path.display());
        return Ok(false);
    }

    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;

    let mut line = String::with_capacity(key.len() + 2);
    if !existing.is_empty() && !existing.ends_with('\n') {
        line.push('\n');
    }
    line.push_str(key);
    line.push('\n');
    file.write_all(line.as_bytes())?;

    tracing::info!("Authorized public key added to {}", path.display());
    Ok(true)
}
