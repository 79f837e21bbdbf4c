use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use rand::Rng;
use tokio::fs;

use crate::{
    backends::{ImageConverter, ImageTransfer},
    config::GatewayConfig,
    dispatch::{ExpireTask, PullResult, PullTask, StatusUpdater, TaskRunner, TestMode},
    layers::{self, ImageMetadata, LayerArchive, LayerGraph},
    registry::{DockerRegistry, RegistryOptions, RegistryPull},
    store::ImageStatus,
    utils::{self, META_EXTENSION},
    GatewayError, GatewayResult,
};

use super::{write_metadata, PullReference};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How long a simulated pull lingers in each pipeline state.
pub const SIMULATED_STEP_DELAY: Duration = Duration::from_millis(50);

/// Where layers are merged inside a pull's scratch directory.
pub const ROOTFS_SUBDIR: &str = "rootfs";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Runs pull and expire tasks: registry download, layer merge, conversion and transfer.
pub struct ImageWorker {
    config: Arc<GatewayConfig>,
    converter: Arc<dyn ImageConverter>,
    transfer: Arc<dyn ImageTransfer>,
}

/// The private directory a pull works in under the expand directory.
///
/// Pulls that resolve to the same image id never share files, so each pull owns the merged
/// tree, the converted image and the metadata file it transfers.
#[derive(Debug, Default)]
struct Scratch {
    root: Option<PathBuf>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ImageWorker {
    /// Creates a worker.
    pub fn new(
        config: Arc<GatewayConfig>,
        converter: Arc<dyn ImageConverter>,
        transfer: Arc<dyn ImageTransfer>,
    ) -> Self {
        Self {
            config,
            converter,
            transfer,
        }
    }

    async fn pull(
        &self,
        task: &PullTask,
        updater: &StatusUpdater,
        scratch: &mut Scratch,
    ) -> GatewayResult<PullResult> {
        updater.update(ImageStatus::Pulling, "Getting manifest");

        let reference = PullReference::parse(&task.tag, &self.config)?;
        let location = self.config.location(reference.get_location())?;
        location.remote_type()?;
        let platform = self.config.platform(&task.system)?;

        tracing::info!(system = %task.system, %reference, "pulling image");

        let options = RegistryOptions::from_location(
            reference.get_location(),
            location,
            reference.credentials(&task.tokens),
        );
        let registry = DockerRegistry::new(options).await?;

        let verified = registry
            .fetch_manifest(reference.get_repository(), reference.get_tag())
            .await?;
        let graph = LayerGraph::build(&verified.manifest)?;
        let metadata = graph.image_metadata();
        let private = registry.is_private();

        let scratch_dir = self.config.get_expand_directory().join(format!(
            "{}.{}",
            metadata.id,
            uuid::Uuid::new_v4()
        ));
        fs::create_dir_all(&scratch_dir).await?;
        scratch.root = Some(scratch_dir.clone());

        let image_name = format!("{}.{}", metadata.id, task.format);
        let meta_name = format!("{}.{META_EXTENSION}", metadata.id);

        if self
            .transfer
            .image_exists(platform, &image_name, &meta_name)
            .await?
        {
            tracing::info!(id = %metadata.id, "image already staged, refreshing metadata");

            let meta = self
                .write_meta(task, &metadata, private, &scratch_dir)
                .await?;
            updater.update(ImageStatus::Transfer, "Transferring metadata");
            if !self.transfer.transfer(platform, None, Some(&meta)).await? {
                return Err(GatewayError::TransferFailure(format!(
                    "transferring {meta_name} to {} failed",
                    task.system
                )));
            }

            return Ok(PullResult {
                metadata,
                private,
                meta_only: true,
            });
        }

        let layers = pull_layers(
            &registry,
            reference.get_repository(),
            &graph,
            self.config.get_cache_directory(),
            updater,
        )
        .await?;

        let expanded = scratch_dir.join(ROOTFS_SUBDIR);

        updater.update(ImageStatus::Pulling, "Extracting layers");
        layers::extract_layers(&layers, &expanded).await?;

        updater.update(ImageStatus::Examination, "Examining image");
        if !fs::metadata(&expanded).await?.is_dir() {
            return Err(GatewayError::Extraction(format!(
                "{} is not a directory",
                expanded.display()
            )));
        }

        updater.update(ImageStatus::Conversion, "Converting image");
        let image = scratch_dir.join(&image_name);
        if !self
            .converter
            .convert(&task.format, &expanded, &image, platform)
            .await?
        {
            return Err(GatewayError::ConversionFailure(format!(
                "{} conversion of {} failed",
                task.format, metadata.id
            )));
        }

        let meta = self
            .write_meta(task, &metadata, private, &scratch_dir)
            .await?;

        updater.update(ImageStatus::Transfer, "Transferring image");
        if !self
            .transfer
            .transfer(platform, Some(&image), Some(&meta))
            .await?
        {
            return Err(GatewayError::TransferFailure(format!(
                "transferring {image_name} to {} failed",
                task.system
            )));
        }

        tracing::info!(system = %task.system, id = %metadata.id, "image staged");

        Ok(PullResult {
            metadata,
            private,
            meta_only: false,
        })
    }

    async fn write_meta(
        &self,
        task: &PullTask,
        metadata: &ImageMetadata,
        private: bool,
        dir: &Path,
    ) -> GatewayResult<PathBuf> {
        write_metadata(
            dir,
            &task.format,
            metadata,
            private,
            &task.user_acl,
            &task.group_acl,
        )
        .await
    }

    async fn simulate(&self, updater: &StatusUpdater) -> GatewayResult<PullResult> {
        for state in [
            ImageStatus::Pulling,
            ImageStatus::Examination,
            ImageStatus::Conversion,
            ImageStatus::Transfer,
        ] {
            updater.update(state, state.as_str());
            tokio::time::sleep(SIMULATED_STEP_DELAY).await;
        }

        let id = format!("{:x}", rand::thread_rng().gen_range(0..100_000u32));

        Ok(PullResult {
            metadata: ImageMetadata {
                id,
                env: vec!["FOO=bar".to_string(), "BAZ=boz".to_string()],
                entrypoint: Some(vec!["./blah".to_string()]),
                workdir: Some("/root".to_string()),
                ..Default::default()
            },
            private: false,
            meta_only: false,
        })
    }

    /// Removes the scratch directory of a pull, never touching anything outside the expand
    /// directory.
    async fn cleanup(&self, scratch: &Scratch) {
        let root = self.config.get_expand_directory();
        let Some(path) = &scratch.root else {
            return;
        };

        if path == root || !utils::is_within(root, path) {
            tracing::error!(
                path = %path.display(),
                "refusing to remove a path outside the expand directory"
            );
            return;
        }

        let removed = match fs::symlink_metadata(path).await {
            Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path).await,
            Ok(_) => fs::remove_file(path).await,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => Err(e),
        };

        match removed {
            Ok(()) => tracing::debug!(path = %path.display(), "removed scratch directory"),
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to remove scratch directory")
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Downloads every blob of the chain, base first, refreshing the heartbeat per layer.
///
/// Deny-listed blobs are left out of the result.
pub async fn pull_layers(
    registry: &dyn RegistryPull,
    repository: &str,
    graph: &LayerGraph,
    cache_dir: &Path,
    updater: &StatusUpdater,
) -> GatewayResult<Vec<LayerArchive>> {
    let mut layers = Vec::with_capacity(graph.len());

    for (index, node) in graph.chain().enumerate() {
        updater.update(
            ImageStatus::Pulling,
            format!("Pulling layer {} of {}", index + 1, graph.len()),
        );

        if let Some(path) = registry
            .fetch_layer(repository, &node.blob_digest, cache_dir)
            .await?
        {
            layers.push(LayerArchive {
                digest: node.blob_digest.clone(),
                path,
            });
        }
    }

    Ok(layers)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl TaskRunner for ImageWorker {
    async fn run_pull(
        &self,
        task: &PullTask,
        updater: &StatusUpdater,
    ) -> GatewayResult<PullResult> {
        match task.test_mode {
            TestMode::Simulate => return self.simulate(updater).await,
            TestMode::Fail => {
                return Err(GatewayError::custom(anyhow::anyhow!("task failed")));
            }
            TestMode::Off => {}
        }

        let mut scratch = Scratch::default();
        let result = self.pull(task, updater, &mut scratch).await;
        self.cleanup(&scratch).await;

        if let Err(e) = &result {
            tracing::error!(system = %task.system, tag = %task.tag, error = %e, "pull failed");
        }

        result
    }

    async fn run_expire(&self, task: &ExpireTask, _updater: &StatusUpdater) -> GatewayResult<()> {
        let platform = self.config.platform(&task.system)?;
        let image = format!("{}.{}", task.id, task.format);
        let meta = format!("{}.{META_EXTENSION}", task.id);

        tracing::info!(system = %task.system, id = %task.id, "removing image");
        if !self.transfer.remove(platform, &image, &meta).await? {
            return Err(GatewayError::TransferFailure(format!(
                "removing {image} from {} failed",
                task.system
            )));
        }

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet, HashMap};

    use tempfile::{tempdir, TempDir};

    use super::*;
    use crate::{
        backends::{CommandConverter, PlatformTransfer},
        config::{AccessType, LocalAccess, PlatformConfig},
    };

    #[test_log::test(tokio::test)]
    async fn test_image_worker_test_modes() -> anyhow::Result<()> {
        let (_temp_dir, worker) = helper::worker()?;

        let result = worker
            .run_pull(
                &helper::pull_task(TestMode::Simulate),
                &StatusUpdater::noop(),
            )
            .await?;
        assert!(!result.metadata.id.is_empty());
        assert_eq!(result.metadata.workdir.as_deref(), Some("/root"));

        let result = worker
            .run_pull(&helper::pull_task(TestMode::Fail), &StatusUpdater::noop())
            .await;
        assert!(result.is_err());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_image_worker_cleanup_stays_inside_expand_directory() -> anyhow::Result<()> {
        let (temp_dir, worker) = helper::worker()?;
        let expand_dir = worker.config.get_expand_directory().clone();
        let scratch_dir = expand_dir.join("abc.1");
        std::fs::create_dir_all(scratch_dir.join("rootfs/usr"))?;
        std::fs::write(scratch_dir.join("abc.squashfs"), "image")?;

        // Another pull of the same image keeps its own files
        let neighbour = expand_dir.join("abc.2");
        std::fs::create_dir_all(&neighbour)?;
        std::fs::write(neighbour.join("abc.squashfs"), "image")?;

        let outside = temp_dir.path().join("precious");
        std::fs::create_dir_all(&outside)?;

        worker
            .cleanup(&Scratch {
                root: Some(scratch_dir.clone()),
            })
            .await;
        worker
            .cleanup(&Scratch {
                root: Some(expand_dir.join("../precious")),
            })
            .await;
        worker
            .cleanup(&Scratch {
                root: Some(expand_dir.clone()),
            })
            .await;

        assert!(!scratch_dir.exists());
        assert!(neighbour.join("abc.squashfs").exists());
        assert!(outside.exists());
        assert!(expand_dir.exists());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_image_worker_expire_removes_staged_files() -> anyhow::Result<()> {
        let (temp_dir, worker) = helper::worker()?;
        let image_dir = temp_dir.path().join("images");
        std::fs::write(image_dir.join("abc.squashfs"), "image")?;
        std::fs::write(image_dir.join("abc.meta"), "FORMAT: squashfs\n")?;

        worker
            .run_expire(
                &ExpireTask {
                    system: "cluster".into(),
                    id: "abc".into(),
                    format: "squashfs".into(),
                },
                &StatusUpdater::noop(),
            )
            .await?;

        assert!(!image_dir.join("abc.squashfs").exists());
        assert!(!image_dir.join("abc.meta").exists());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_image_worker_unknown_platform_fails() -> anyhow::Result<()> {
        let (_temp_dir, worker) = helper::worker()?;
        let mut task = helper::pull_task(TestMode::Off);
        task.system = "elsewhere".into();

        let result = worker.run_pull(&task, &StatusUpdater::noop()).await;
        assert!(matches!(result, Err(GatewayError::Configuration(_))));

        Ok(())
    }

    mod helper {
        use super::*;

        pub(super) fn worker() -> anyhow::Result<(TempDir, ImageWorker)> {
            let temp_dir = tempdir()?;
            let image_dir = temp_dir.path().join("images");
            std::fs::create_dir_all(&image_dir)?;

            let platform = PlatformConfig::builder()
                .accesstype(AccessType::Local)
                .local(Some(LocalAccess::builder().image_dir(image_dir).build()))
                .build();

            let config = GatewayConfig::builder()
                .platforms(HashMap::from([("cluster".to_string(), platform)]))
                .cache_directory(temp_dir.path().join("cache"))
                .expand_directory(temp_dir.path().join("expand"))
                .build();

            let worker = ImageWorker::new(
                Arc::new(config),
                Arc::new(CommandConverter),
                Arc::new(PlatformTransfer),
            );

            Ok((temp_dir, worker))
        }

        pub(super) fn pull_task(test_mode: TestMode) -> PullTask {
            PullTask {
                system: "cluster".into(),
                itype: "docker".into(),
                tag: "ubuntu:latest".into(),
                user_acl: BTreeSet::new(),
                group_acl: BTreeSet::new(),
                remotetype: "dockerv2".into(),
                format: "mock".into(),
                tokens: BTreeMap::new(),
                test_mode,
            }
        }
    }
}
