#![forbid(unsafe_code)]

//! Process-level safety checks for the songfetch server.

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Refuses to start when running as root. The server spawns yt-dlp and
/// deletes files from the download directory, so it should only ever run as
/// an unprivileged service account.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!("{process} must not be run as root; use a dedicated service account");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Uid;

    #[test]
    fn unprivileged_uid_is_accepted() {
        assert!(ensure_not_root_for(Uid::from_raw(1000), "server").is_ok());
    }

    #[test]
    fn root_uid_is_rejected() {
        let err = ensure_not_root_for(Uid::from_raw(0), "server").unwrap_err();
        assert!(err.to_string().contains("must not be run as root"));
    }
}
