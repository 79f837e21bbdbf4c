use std::{path::Path, time::Duration};

use serde::Serialize;

use crate::{
    config::GatewayConfig,
    dispatch::TestMode,
    manager::{AclSpec, AdminOutcome, ImageManager, ImageSpec, Session},
    utils::{self, CONFIG_FILENAME},
    GatewayError, GatewayResult,
};

use super::{ImageArgs, ImagegwSubcommand, SessionArgs};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How often `--wait` polls for task results.
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Loads the gateway configuration from `path`, or from the home directory when unset.
pub async fn load_config(path: Option<&Path>) -> GatewayResult<GatewayConfig> {
    match path {
        Some(path) => GatewayConfig::load(path).await,
        None => GatewayConfig::load(utils::get_imagegw_home_path().join(CONFIG_FILENAME)).await,
    }
}

/// Runs a subcommand against a manager built from `config` and prints the result as JSON.
pub async fn run_subcommand(
    config: GatewayConfig,
    subcommand: ImagegwSubcommand,
) -> GatewayResult<()> {
    let manager = ImageManager::open(config).await?;

    match subcommand {
        ImagegwSubcommand::Lookup { image } => {
            let (session, spec) = open_image(&manager, &image).await?;
            print_json(&manager.lookup(&session, &spec).await?)
        }
        ImagegwSubcommand::Pull {
            image,
            wait,
            user_acl,
            group_acl,
            simulate,
        } => {
            let (session, spec) = open_image(&manager, &image).await?;
            let acls = AclSpec::new(user_acl, group_acl);
            let test_mode = if simulate {
                TestMode::Simulate
            } else {
                TestMode::Off
            };

            let record = manager
                .pull_with_test_mode(&session, &spec, &acls, test_mode)
                .await?;
            if !wait {
                return print_json(&record);
            }

            let timeout = manager
                .config()
                .pull_timeout()
                .to_std()
                .map_err(GatewayError::custom)?;
            let settled = tokio::time::timeout(timeout, manager.wait_for(&record, WAIT_POLL_INTERVAL))
                .await
                .map_err(|_| {
                    GatewayError::custom(anyhow::anyhow!(
                        "pull of {} did not settle within {}s",
                        spec.tag,
                        timeout.as_secs()
                    ))
                })??;
            print_json(&settled)
        }
        ImagegwSubcommand::Images { session } => {
            let caller = open_session(&manager, &session).await?;
            print_json(&manager.imglist(&caller, &session.system).await?)
        }
        ImagegwSubcommand::Queue { session } => {
            let caller = open_session(&manager, &session).await?;
            print_json(&manager.show_queue(&caller, &session.system).await?)
        }
        ImagegwSubcommand::Expire { image, wait } => {
            let (session, spec) = open_image(&manager, &image).await?;
            let record = granted(manager.expire(&session, &spec).await?, &session)?;
            if wait {
                drain_tasks(&manager).await?;
            }
            print_json(&record)
        }
        ImagegwSubcommand::Autoexpire { session, wait } => {
            let caller = open_session(&manager, &session).await?;
            let expired = granted(manager.autoexpire(&caller, &session.system).await?, &caller)?;
            if wait {
                drain_tasks(&manager).await?;
            }
            print_json(&expired)
        }
        ImagegwSubcommand::Metrics { session, limit } => {
            let caller = open_session(&manager, &session).await?;
            let metrics = granted(
                manager.get_metrics(&caller, &session.system, limit).await?,
                &caller,
            )?;
            print_json(&metrics)
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

async fn open_session(manager: &ImageManager, args: &SessionArgs) -> GatewayResult<Session> {
    manager.new_session(&args.auth, &args.system).await
}

async fn open_image(
    manager: &ImageManager,
    args: &ImageArgs,
) -> GatewayResult<(Session, ImageSpec)> {
    let session = open_session(manager, &args.session).await?;
    let spec = ImageSpec::new(&args.session.system, &args.itype, &args.tag);
    Ok((session, spec))
}

fn granted<T>(outcome: AdminOutcome<T>, session: &Session) -> GatewayResult<T> {
    match outcome {
        AdminOutcome::Granted(value) => Ok(value),
        AdminOutcome::Denied => Err(GatewayError::custom(anyhow::anyhow!(
            "{} is not an admin of {}",
            session.user,
            session.system
        ))),
    }
}

async fn drain_tasks(manager: &ImageManager) -> GatewayResult<()> {
    loop {
        manager.update_states().await?;
        if manager.pending_tasks().await == 0 {
            return Ok(());
        }

        tokio::time::sleep(WAIT_POLL_INTERVAL).await;
    }
}

fn print_json(value: &impl Serialize) -> GatewayResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
