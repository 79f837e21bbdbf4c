use std::{
    collections::BTreeSet,
    fmt::Write,
    path::{Path, PathBuf},
};

use tokio::fs;

use crate::{
    layers::ImageMetadata,
    utils::{META_EXTENSION, PARTIAL_EXTENSION},
    GatewayResult,
};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Renders the line oriented metadata file read by the runtime on a system.
///
/// ACL lines are only written for private images.
pub fn render_metadata(
    format: &str,
    metadata: &ImageMetadata,
    private: bool,
    user_acl: &BTreeSet<u32>,
    group_acl: &BTreeSet<u32>,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "FORMAT: {format}");

    if let Some(entry) = &metadata.entrypoint {
        let _ = writeln!(out, "ENTRY: {}", entry.join(" "));
    }

    if let Some(workdir) = &metadata.workdir {
        let _ = writeln!(out, "WORKDIR: {workdir}");
    }

    if private {
        let _ = writeln!(out, "USERACL: {}", join_ids(user_acl));
        let _ = writeln!(out, "GROUPACL: {}", join_ids(group_acl));
    }

    for env in &metadata.env {
        let _ = writeln!(out, "ENV: {env}");
    }

    out
}

/// Writes the metadata file to `<dir>/<id>.meta` through a temporary file and returns its path.
pub async fn write_metadata(
    dir: &Path,
    format: &str,
    metadata: &ImageMetadata,
    private: bool,
    user_acl: &BTreeSet<u32>,
    group_acl: &BTreeSet<u32>,
) -> GatewayResult<PathBuf> {
    let contents = render_metadata(format, metadata, private, user_acl, group_acl);
    let target = dir.join(format!("{}.{META_EXTENSION}", metadata.id));
    let partial = dir.join(format!(
        "{}.{}.{META_EXTENSION}.{PARTIAL_EXTENSION}",
        metadata.id,
        uuid::Uuid::new_v4()
    ));

    fs::write(&partial, contents).await?;
    if let Err(e) = fs::rename(&partial, &target).await {
        let _ = fs::remove_file(&partial).await;
        return Err(e.into());
    }

    Ok(target)
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn join_ids(ids: &BTreeSet<u32>) -> String {
    ids.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn metadata() -> ImageMetadata {
        ImageMetadata {
            id: "abc".into(),
            env: vec!["PATH=/usr/bin".into(), "LANG=C".into()],
            entrypoint: Some(vec!["/bin/sh".into(), "-c".into()]),
            workdir: Some("/work".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_render_metadata_public_image() {
        let rendered = render_metadata(
            "squashfs",
            &metadata(),
            false,
            &BTreeSet::from([1000]),
            &BTreeSet::new(),
        );

        assert_eq!(
            rendered,
            "FORMAT: squashfs\nENTRY: /bin/sh -c\nWORKDIR: /work\nENV: PATH=/usr/bin\nENV: LANG=C\n"
        );
    }

    #[test]
    fn test_render_metadata_private_image_lists_acls() {
        let rendered = render_metadata(
            "squashfs",
            &ImageMetadata {
                id: "abc".into(),
                ..Default::default()
            },
            true,
            &BTreeSet::from([1001, 1000]),
            &BTreeSet::from([100]),
        );

        assert_eq!(
            rendered,
            "FORMAT: squashfs\nUSERACL: 1000,1001\nGROUPACL: 100\n"
        );
    }

    #[tokio::test]
    async fn test_write_metadata_renames_into_place() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let path = write_metadata(
            temp_dir.path(),
            "mock",
            &metadata(),
            false,
            &BTreeSet::new(),
            &BTreeSet::new(),
        )
        .await?;

        assert_eq!(path, temp_dir.path().join("abc.meta"));
        assert!(fs::read_to_string(&path).await?.starts_with("FORMAT: mock\n"));
        assert_eq!(std::fs::read_dir(temp_dir.path())?.count(), 1);

        Ok(())
    }
}
