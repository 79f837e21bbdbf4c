use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use tokio::{fs, process::Command};

use crate::{
    config::{AccessType, LocalAccess, PlatformConfig, SshAccess},
    utils::PARTIAL_EXTENSION,
    GatewayError, GatewayResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Moves images onto systems according to their access type.
///
/// `local` systems have their image directory mounted on the gateway host. `remote` systems are
/// reached with `scp` and `ssh`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlatformTransfer;

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Places staged image files into a system's image directory and removes them again.
#[async_trait]
pub trait ImageTransfer: Send + Sync {
    /// Copies the image and its metadata file. Either may be omitted.
    async fn transfer(
        &self,
        platform: &PlatformConfig,
        image: Option<&Path>,
        meta: Option<&Path>,
    ) -> GatewayResult<bool>;

    /// Removes the image and metadata files named `image` and `meta`.
    async fn remove(&self, platform: &PlatformConfig, image: &str, meta: &str)
        -> GatewayResult<bool>;

    /// Returns true if the system already holds the image file named `image`.
    async fn image_exists(
        &self,
        platform: &PlatformConfig,
        image: &str,
        meta: &str,
    ) -> GatewayResult<bool>;
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn local_access(platform: &PlatformConfig) -> GatewayResult<&LocalAccess> {
    platform.get_local().as_ref().ok_or_else(|| {
        GatewayError::Configuration("local platform has no local settings".to_string())
    })
}

fn ssh_access(platform: &PlatformConfig) -> GatewayResult<(&SshAccess, &str)> {
    let ssh = platform.get_ssh().as_ref().ok_or_else(|| {
        GatewayError::Configuration("remote platform has no ssh settings".to_string())
    })?;
    let host = platform
        .get_host()
        .first()
        .ok_or_else(|| GatewayError::Configuration("remote platform has no host".to_string()))?;

    Ok((ssh, host))
}

fn file_name(path: &Path) -> GatewayResult<&std::ffi::OsStr> {
    path.file_name().ok_or_else(|| {
        GatewayError::TransferFailure(format!("{} has no file name", path.display()))
    })
}

async fn run_command(program: &str, args: Vec<OsString>) -> GatewayResult<bool> {
    let output = Command::new(program)
        .args(&args)
        .output()
        .await
        .map_err(|e| GatewayError::TransferFailure(format!("{program}: {e}")))?;

    if !output.status.success() {
        tracing::warn!(
            %program,
            status = %output.status,
            stderr = %String::from_utf8_lossy(&output.stderr),
            "transfer command failed"
        );
    }

    Ok(output.status.success())
}

async fn copy_local(platform: &PlatformConfig, file: &Path) -> GatewayResult<bool> {
    let local = local_access(platform)?;
    let name = file_name(file)?;
    let target = local.get_image_dir().join(name);

    if !platform.get_cp_cmd_options().is_empty() {
        let mut args: Vec<OsString> = platform
            .get_cp_cmd_options()
            .iter()
            .map(OsString::from)
            .collect();
        args.push(file.into());
        args.push(target.into());
        return run_command("cp", args).await;
    }

    // Copy next to the target, then rename so readers never see a partial image
    let mut partial_name = name.to_os_string();
    partial_name.push(format!(".{}.{PARTIAL_EXTENSION}", uuid::Uuid::new_v4()));
    let partial = local.get_image_dir().join(partial_name);

    if let Err(e) = fs::copy(file, &partial).await {
        let _ = fs::remove_file(&partial).await;
        return Err(GatewayError::TransferFailure(format!(
            "copying {} failed: {e}",
            file.display()
        )));
    }
    fs::rename(&partial, &target).await?;

    Ok(true)
}

async fn remove_local(platform: &PlatformConfig, name: &str) -> GatewayResult<bool> {
    let target = local_access(platform)?.get_image_dir().join(name);
    match fs::remove_file(&target).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %target.display(), "file to remove does not exist");
            Ok(true)
        }
        Err(e) => Err(GatewayError::TransferFailure(format!(
            "removing {} failed: {e}",
            target.display()
        ))),
    }
}

fn ssh_key_args(ssh: &SshAccess) -> Vec<OsString> {
    match ssh.get_key() {
        Some(key) => vec!["-i".into(), key.into()],
        None => Vec::new(),
    }
}

async fn copy_remote(platform: &PlatformConfig, file: &Path) -> GatewayResult<bool> {
    let (ssh, host) = ssh_access(platform)?;
    let remote = ssh.get_image_dir().join(file_name(file)?);

    let mut args = ssh_key_args(ssh);
    args.extend(platform.get_scp_cmd_options().iter().map(OsString::from));
    args.push(file.into());
    args.push(format!("{}@{host}:{}", ssh.get_username(), remote.display()).into());

    run_command("scp", args).await
}

async fn ssh_remote(
    platform: &PlatformConfig,
    command: &[&str],
    path: PathBuf,
) -> GatewayResult<bool> {
    let (ssh, host) = ssh_access(platform)?;

    let mut args = ssh_key_args(ssh);
    args.extend(platform.get_ssh_cmd_options().iter().map(OsString::from));
    args.push(format!("{}@{host}", ssh.get_username()).into());
    args.extend(command.iter().map(OsString::from));
    args.push(path.into());

    run_command("ssh", args).await
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ImageTransfer for PlatformTransfer {
    async fn transfer(
        &self,
        platform: &PlatformConfig,
        image: Option<&Path>,
        meta: Option<&Path>,
    ) -> GatewayResult<bool> {
        // The image goes first so a metadata file never points at a missing image
        for file in [image, meta].into_iter().flatten() {
            let copied = match platform.get_accesstype() {
                AccessType::Local => copy_local(platform, file).await?,
                AccessType::Remote => copy_remote(platform, file).await?,
            };

            if !copied {
                return Ok(false);
            }
            tracing::info!(file = %file.display(), "transferred file");
        }

        Ok(true)
    }

    async fn remove(
        &self,
        platform: &PlatformConfig,
        image: &str,
        meta: &str,
    ) -> GatewayResult<bool> {
        let mut removed = true;
        for name in [meta, image] {
            removed &= match platform.get_accesstype() {
                AccessType::Local => remove_local(platform, name).await?,
                AccessType::Remote => {
                    let path = ssh_access(platform)?.0.get_image_dir().join(name);
                    ssh_remote(platform, &["rm", "-f"], path).await?
                }
            };
        }

        Ok(removed)
    }

    async fn image_exists(
        &self,
        platform: &PlatformConfig,
        image: &str,
        _meta: &str,
    ) -> GatewayResult<bool> {
        match platform.get_accesstype() {
            AccessType::Local => {
                let path = local_access(platform)?.get_image_dir().join(image);
                Ok(fs::try_exists(path).await?)
            }
            AccessType::Remote => {
                let path = ssh_access(platform)?.0.get_image_dir().join(image);
                ssh_remote(platform, &["test", "-e"], path).await
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn local_platform(image_dir: &Path) -> PlatformConfig {
        PlatformConfig::builder()
            .accesstype(AccessType::Local)
            .local(Some(
                LocalAccess::builder().image_dir(image_dir.to_path_buf()).build(),
            ))
            .build()
    }

    #[tokio::test]
    async fn test_platform_transfer_local_lifecycle() -> anyhow::Result<()> {
        let staging = tempdir()?;
        let image_dir = tempdir()?;
        let platform = local_platform(image_dir.path());

        let image = staging.path().join("abc.squashfs");
        let meta = staging.path().join("abc.meta");
        fs::write(&image, "image").await?;
        fs::write(&meta, "FORMAT: squashfs\n").await?;

        assert!(
            !PlatformTransfer
                .image_exists(&platform, "abc.squashfs", "abc.meta")
                .await?
        );
        assert!(
            PlatformTransfer
                .transfer(&platform, Some(&image), Some(&meta))
                .await?
        );
        assert!(
            PlatformTransfer
                .image_exists(&platform, "abc.squashfs", "abc.meta")
                .await?
        );
        assert_eq!(
            fs::read_to_string(image_dir.path().join("abc.meta")).await?,
            "FORMAT: squashfs\n"
        );

        assert!(
            PlatformTransfer
                .remove(&platform, "abc.squashfs", "abc.meta")
                .await?
        );
        assert!(!image_dir.path().join("abc.squashfs").exists());
        assert!(!image_dir.path().join("abc.meta").exists());

        Ok(())
    }

    #[tokio::test]
    async fn test_platform_transfer_requires_settings() {
        let platform = PlatformConfig::builder()
            .accesstype(AccessType::Remote)
            .build();

        let result = PlatformTransfer
            .image_exists(&platform, "abc.squashfs", "abc.meta")
            .await;
        assert!(matches!(result, Err(GatewayError::Configuration(_))));
    }
}
