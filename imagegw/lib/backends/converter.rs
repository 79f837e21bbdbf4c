use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use tokio::{fs, process::Command};

use crate::{config::PlatformConfig, utils::PARTIAL_EXTENSION, GatewayError, GatewayResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Placeholder content written by the `mock` format.
pub const MOCK_IMAGE_CONTENT: &str = "bogus";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Converts expanded trees with the system's image tools.
///
/// Supports `squashfs` through `mksquashfs`, `cramfs` through `mkfs.cramfs` and a `mock` format
/// that writes a placeholder file.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandConverter;

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Turns an expanded root filesystem into a single image file.
#[async_trait]
pub trait ImageConverter: Send + Sync {
    /// Writes `expanded` as a `format` image to `image`. Returns false if the tool ran but failed.
    ///
    /// ## Errors
    ///
    /// Returns `ConversionFailure` for unsupported formats or missing tools.
    async fn convert(
        &self,
        format: &str,
        expanded: &Path,
        image: &Path,
        platform: &PlatformConfig,
    ) -> GatewayResult<bool>;
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn partial_path(image: &Path) -> PathBuf {
    let name = image
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    image.with_file_name(format!(
        "{name}.{}.{PARTIAL_EXTENSION}",
        uuid::Uuid::new_v4()
    ))
}

async fn run_tool(tool: &str, args: &[&OsStr]) -> GatewayResult<bool> {
    let program = which::which(tool)
        .map_err(|e| GatewayError::ConversionFailure(format!("{tool} not found: {e}")))?;

    let output = Command::new(&program).args(args).output().await?;
    if !output.status.success() {
        tracing::warn!(
            %tool,
            status = %output.status,
            stderr = %String::from_utf8_lossy(&output.stderr),
            "image tool failed"
        );
        return Ok(false);
    }

    Ok(true)
}

async fn write_image(
    format: &str,
    expanded: &Path,
    target: &Path,
    platform: &PlatformConfig,
) -> GatewayResult<bool> {
    match format {
        "squashfs" => {
            let mut args = vec![
                expanded.as_os_str(),
                target.as_os_str(),
                OsStr::new("-all-root"),
            ];
            if *platform.get_no_xattrs() {
                args.push(OsStr::new("-no-xattrs"));
            }
            run_tool("mksquashfs", &args).await
        }
        "cramfs" => run_tool("mkfs.cramfs", &[expanded.as_os_str(), target.as_os_str()]).await,
        "mock" => {
            fs::write(target, MOCK_IMAGE_CONTENT).await?;
            Ok(true)
        }
        "ext4" => Err(GatewayError::ConversionFailure(
            "ext4 images are not supported".to_string(),
        )),
        other => Err(GatewayError::ConversionFailure(format!(
            "{other} is not a supported format"
        ))),
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ImageConverter for CommandConverter {
    async fn convert(
        &self,
        format: &str,
        expanded: &Path,
        image: &Path,
        platform: &PlatformConfig,
    ) -> GatewayResult<bool> {
        if fs::try_exists(image).await? {
            tracing::info!(image = %image.display(), "image already converted");
            return Ok(true);
        }

        let partial = partial_path(image);
        let written = write_image(format, expanded, &partial, platform).await;

        match written {
            Ok(true) => {
                fs::rename(&partial, image).await?;
                tracing::info!(%format, image = %image.display(), "converted image");
                Ok(true)
            }
            other => {
                if fs::try_exists(&partial).await.unwrap_or(false) {
                    fs::remove_file(&partial).await?;
                }
                other
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

    #[tokio::test]
    async fn test_command_converter_mock_format() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let expanded = temp_dir.path().join("expanded");
        fs::create_dir_all(&expanded).await?;
        let image = temp_dir.path().join("abc.mock");
        let platform = PlatformConfig::builder().build();

        assert!(
            CommandConverter
                .convert("mock", &expanded, &image, &platform)
                .await?
        );
        assert_eq!(fs::read_to_string(&image).await?, MOCK_IMAGE_CONTENT);

        // No partial files are left next to the image
        let mut entries = fs::read_dir(temp_dir.path()).await?;
        while let Some(entry) = entries.next_entry().await? {
            assert!(!entry
                .file_name()
                .to_string_lossy()
                .ends_with(PARTIAL_EXTENSION));
        }

        Ok(())
    }

    #[tokio::test]
    async fn test_command_converter_existing_image_short_circuits() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let image = temp_dir.path().join("abc.squashfs");
        fs::write(&image, "already here").await?;
        let platform = PlatformConfig::builder().build();

        // squashfs would need mksquashfs, which the existing image makes unnecessary
        assert!(
            CommandConverter
                .convert("squashfs", temp_dir.path(), &image, &platform)
                .await?
        );
        assert_eq!(fs::read_to_string(&image).await?, "already here");

        Ok(())
    }

    #[tokio::test]
    async fn test_command_converter_rejects_unsupported_formats() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let platform = PlatformConfig::builder().build();

        for format in ["ext4", "vfat"] {
            let image = temp_dir.path().join(format!("abc.{format}"));
            let result = CommandConverter
                .convert(format, temp_dir.path(), &image, &platform)
                .await;
            assert!(matches!(result, Err(GatewayError::ConversionFailure(_))));
            assert!(!image.exists());
        }

        Ok(())
    }
}
