//! Short-lived `cookies.txt` handed to yt-dlp.

use crate::config::Secret;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const COOKIES_FILE: &str = "cookies.txt";

/// Owns `<work_dir>/cookies.txt` for the duration of a run and deletes it
/// when dropped, whichever way the run ends.
#[derive(Debug)]
pub struct CookieFile {
    path: PathBuf,
}

impl CookieFile {
    /// Writes the cookie body. Returns `None` when no cookies are configured.
    pub fn install(work_dir: &Path, body: Option<&Secret>) -> Result<Option<Self>> {
        let Some(body) = body else {
            return Ok(None);
        };
        fs::create_dir_all(work_dir)
            .with_context(|| format!("creating {}", work_dir.display()))?;
        let path = work_dir.join(COOKIES_FILE);
        let mut contents = body.expose().to_string();
        if !contents.ends_with('\n') {
            contents.push('\n');
        }
        fs::write(&path, contents).with_context(|| format!("writing {}", path.display()))?;
        restrict_permissions(&path);
        info!("Wrote cookies to {}", path.display());
        Ok(Some(Self { path }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CookieFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => info!("Removed {}", self.path.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!("Could not remove {}: {}", self.path.display(), err),
        }
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(err) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
        warn!("Could not restrict permissions on {}: {}", path.display(), err);
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}
