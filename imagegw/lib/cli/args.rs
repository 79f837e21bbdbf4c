use std::path::PathBuf;

use clap::{Args, Parser};

use crate::config::DEFAULT_IMAGE_TYPE;

use super::STYLES;

//-------------------------------------------------------------------------------------------------
// Constants
//-------------------------------------------------------------------------------------------------

/// The number of metrics `imagegw metrics` prints by default.
pub const DEFAULT_METRICS_LIMIT: usize = 100;

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

/// imagegw - Pulls container images from Docker registries and stages them on HPC systems
#[derive(Debug, Parser)]
#[command(name = "imagegw", author, about, version, styles = STYLES)]
pub struct ImagegwArgs {
    /// The subcommand to run
    #[command(subcommand)]
    pub subcommand: Option<ImagegwSubcommand>,

    /// Path to the gateway configuration, defaults to `$IMAGEGW_HOME/imagegw.toml`
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available subcommands
#[derive(Debug, Parser)]
pub enum ImagegwSubcommand {
    /// Show the READY image holding a tag
    #[command(name = "lookup")]
    Lookup {
        /// The image to look up
        #[command(flatten)]
        image: ImageArgs,
    },

    /// Pull an image onto a system
    #[command(name = "pull")]
    Pull {
        /// The image to pull
        #[command(flatten)]
        image: ImageArgs,

        /// Wait until the pull settles. Workers run inside this process, so without it the pull
        /// only proceeds while the command is running
        #[arg(long)]
        wait: bool,

        /// User ids allowed to see a private image
        #[arg(long = "user-acl", value_delimiter = ',')]
        user_acl: Vec<u32>,

        /// Group ids allowed to see a private image
        #[arg(long = "group-acl", value_delimiter = ',')]
        group_acl: Vec<u32>,

        /// Walk through the pull states without contacting a registry
        #[arg(long)]
        simulate: bool,
    },

    /// List the READY images on a system
    #[command(name = "images")]
    Images {
        /// The caller
        #[command(flatten)]
        session: SessionArgs,
    },

    /// List pulls that are in flight or failed
    #[command(name = "queue")]
    Queue {
        /// The caller
        #[command(flatten)]
        session: SessionArgs,
    },

    /// Remove an image from a system
    #[command(name = "expire")]
    Expire {
        /// The image to expire
        #[command(flatten)]
        image: ImageArgs,

        /// Wait until the remove task finishes
        #[arg(long)]
        wait: bool,
    },

    /// Purge stuck pulls and expire images past their expiration
    #[command(name = "autoexpire")]
    Autoexpire {
        /// The caller
        #[command(flatten)]
        session: SessionArgs,

        /// Wait until the remove tasks finish
        #[arg(long)]
        wait: bool,
    },

    /// Show the latest image lookups
    #[command(name = "metrics")]
    Metrics {
        /// The caller
        #[command(flatten)]
        session: SessionArgs,

        /// Maximum number of lookups to show
        #[arg(short, long, default_value_t = DEFAULT_METRICS_LIMIT)]
        limit: usize,
    },
}

/// Identifies the caller and the system they act on
#[derive(Debug, Clone, Args)]
pub struct SessionArgs {
    /// The target system
    #[arg(short, long)]
    pub system: String,

    /// The credential passed to the authenticator
    #[arg(short, long)]
    pub auth: String,
}

/// Identifies an image on a system
#[derive(Debug, Clone, Args)]
pub struct ImageArgs {
    /// The caller
    #[command(flatten)]
    pub session: SessionArgs,

    /// The image type
    #[arg(long, default_value = DEFAULT_IMAGE_TYPE)]
    pub itype: String,

    /// The image tag, e.g. `ubuntu:latest`
    #[arg(value_name = "TAG")]
    pub tag: String,
}

//-------------------------------------------------------------------------------------------------
// Tests
//-------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse_pull() -> anyhow::Result<()> {
        let args = ImagegwArgs::try_parse_from([
            "imagegw",
            "pull",
            "--system",
            "cluster",
            "--auth",
            "good:alice:users",
            "--user-acl",
            "1000,1001",
            "--wait",
            "ubuntu:latest",
        ])?;

        let Some(ImagegwSubcommand::Pull {
            image,
            wait,
            user_acl,
            group_acl,
            simulate,
        }) = args.subcommand
        else {
            panic!("expected the pull subcommand");
        };

        assert_eq!(image.session.system, "cluster");
        assert_eq!(image.itype, DEFAULT_IMAGE_TYPE);
        assert_eq!(image.tag, "ubuntu:latest");
        assert!(wait);
        assert!(!simulate);
        assert_eq!(user_acl, vec![1000, 1001]);
        assert!(group_acl.is_empty());

        Ok(())
    }

    #[test]
    fn test_args_parse_metrics_defaults() -> anyhow::Result<()> {
        let args = ImagegwArgs::try_parse_from([
            "imagegw", "-v", "metrics", "-s", "cluster", "-a", "good:root:root",
        ])?;
        assert!(args.verbose);
        assert!(matches!(
            args.subcommand,
            Some(ImagegwSubcommand::Metrics { limit: DEFAULT_METRICS_LIMIT, .. })
        ));

        assert!(ImagegwArgs::try_parse_from(["imagegw", "lookup", "ubuntu:latest"]).is_err());

        Ok(())
    }
}
