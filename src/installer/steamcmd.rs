//! Locating and bootstrapping SteamCMD.
//!
//! ## Bootstrap flow
//! 1. `ensure_installed()` → binary present? return it
//! 2. otherwise download the platform archive (`reqwest`) into a temp file
//! 3. extract: `.zip` with the `zip` crate, `.tar.gz` with the system `tar`
//! 4. `chmod 0755` on Unix, then verify the binary exists
//!
//! Concurrent installs share a single bootstrap through `bootstrap_lock`.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::utils::apply_creation_flags;

const LINUX_URL: &str = "https://steamcdn-a.akamaihd.net/client/installer/steamcmd_linux.tar.gz";
const MACOS_URL: &str = "https://steamcdn-a.akamaihd.net/client/installer/steamcmd_osx.tar.gz";
const WINDOWS_URL: &str = "https://steamcdn-a.akamaihd.net/client/installer/steamcmd.zip";

pub struct SteamCmd {
    dir: PathBuf,
    url_override: Option<String>,
    bootstrap_lock: Mutex<()>,
}

impl SteamCmd {
    pub fn new(dir: impl Into<PathBuf>, url_override: Option<String>) -> Self {
        Self {
            dir: dir.into(),
            url_override,
            bootstrap_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn executable(&self) -> PathBuf {
        if cfg!(target_os = "windows") {
            self.dir.join("steamcmd.exe")
        } else {
            self.dir.join("steamcmd.sh")
        }
    }

    pub fn is_installed(&self) -> bool {
        self.executable().is_file()
    }

    fn download_url(&self) -> &str {
        if let Some(url) = &self.url_override {
            return url;
        }
        if cfg!(target_os = "windows") {
            WINDOWS_URL
        } else if cfg!(target_os = "macos") {
            MACOS_URL
        } else {
            LINUX_URL
        }
    }

    /// Arguments for an anonymous install/update of `app_id` into `install_dir`.
    pub fn install_args(install_dir: &Path, app_id: u32) -> Vec<String> {
        vec![
            "+force_install_dir".to_string(),
            install_dir.to_string_lossy().into_owned(),
            "+login".to_string(),
            "anonymous".to_string(),
            "+app_update".to_string(),
            app_id.to_string(),
            "validate".to_string(),
            "+quit".to_string(),
        ]
    }

    /// Return the SteamCMD binary, bootstrapping it on first use.
    pub async fn ensure_installed(&self) -> Result<PathBuf> {
        let exe = self.executable();
        if exe.is_file() {
            return Ok(exe);
        }

        let _guard = self.bootstrap_lock.lock().await;
        // Another job may have finished the bootstrap while we waited.
        if exe.is_file() {
            return Ok(exe);
        }

        self.bootstrap().await?;
        if !exe.is_file() {
            return Err(anyhow::anyhow!(
                "SteamCMD bootstrap finished but {} is missing",
                exe.display()
            ));
        }
        Ok(exe)
    }

    async fn bootstrap(&self) -> Result<()> {
        let url = self.download_url().to_string();
        tracing::info!("SteamCMD not found, downloading {}", url);
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let bytes = reqwest::get(&url)
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("Failed to download SteamCMD from {}", url))?
            .bytes()
            .await
            .context("Failed to read SteamCMD archive")?;

        let mut archive = tempfile::Builder::new()
            .prefix("steamcmd-")
            .tempfile_in(&self.dir)
            .context("Failed to create temporary archive")?;
        archive.write_all(&bytes)?;
        archive.flush()?;

        extract_archive(archive.path(), &self.dir, url.ends_with(".zip")).await?;
        set_executable(&self.executable())?;

        tracing::info!("SteamCMD installed to {}", self.dir.display());
        Ok(())
    }
}

/// Unpack `archive` into `dest`.
pub async fn extract_archive(archive: &Path, dest: &Path, is_zip: bool) -> Result<()> {
    if is_zip {
        let archive = archive.to_path_buf();
        let dest = dest.to_path_buf();
        return tokio::task::spawn_blocking(move || -> Result<()> {
            let file = std::fs::File::open(&archive)?;
            let mut zip = zip::ZipArchive::new(file).context("Invalid SteamCMD zip archive")?;
            zip.extract(&dest).context("Failed to extract SteamCMD zip archive")?;
            Ok(())
        })
        .await
        .context("Extraction task panicked")?;
    }

    let mut cmd = Command::new("tar");
    cmd.arg("-xzf").arg(archive).arg("-C").arg(dest);
    apply_creation_flags(&mut cmd);

    let output = cmd.output().await.context("Failed to run tar")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow::anyhow!("tar extraction failed: {}", stderr.trim()));
    }
    Ok(())
}

#[cfg(unix)]
fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if path.exists() {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
            .with_context(|| format!("Failed to chmod {}", path.display()))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}
