use nix::sys::utsname::uname;
use serde::{Deserialize, Serialize};

/// Expose binary and system information.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeMetadata {
    pub towerwatch_version: String,
    pub system_os: String,
    pub arch: String,
}

impl Default for RuntimeMetadata {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeMetadata {
    pub fn new() -> Self {
        let towerwatch_version = env!("CARGO_PKG_VERSION").to_owned();
        match uname() {
            Ok(utsname) => RuntimeMetadata {
                towerwatch_version,
                system_os: format!(
                    "{} {}",
                    utsname.sysname().to_string_lossy(),
                    utsname.release().to_string_lossy(),
                ),
                arch: utsname.machine().to_string_lossy().into_owned(),
            },
            Err(_) => RuntimeMetadata {
                towerwatch_version,
                system_os: std::env::consts::OS.to_string(),
                arch: std::env::consts::ARCH.to_string(),
            },
        }
    }
}
