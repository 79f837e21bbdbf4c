use clap::{CommandFactory, Parser};
use imagegw::{
    cli::{self, ImagegwArgs},
    utils, GatewayResult,
};

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> GatewayResult<()> {
    dotenvy::dotenv().ok();

    let args = ImagegwArgs::parse();
    let Some(subcommand) = args.subcommand else {
        ImagegwArgs::command().print_help()?;
        return Ok(());
    };

    utils::check_or_set_env()?;
    let config = cli::load_config(args.config.as_deref()).await?;
    let _guard = imagegw::init_logging(args.verbose, config.get_log_directory().as_deref())?;

    tracing::debug!(?subcommand, "running subcommand");
    cli::run_subcommand(config, subcommand).await
}
