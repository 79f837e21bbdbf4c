use std::{env, path::PathBuf};

use crate::{config::DEFAULT_IMAGEGW_HOME, GatewayResult};

use super::IMAGEGW_HOME_ENV_VAR;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Checks if the environment variables are set and sets them if they are not.
pub fn check_or_set_env() -> GatewayResult<()> {
    if env::var(IMAGEGW_HOME_ENV_VAR).is_err() {
        tracing::warn!(
            "{IMAGEGW_HOME_ENV_VAR} is not set, setting to default: {}",
            DEFAULT_IMAGEGW_HOME.display()
        );
        unsafe {
            env::set_var(IMAGEGW_HOME_ENV_VAR, DEFAULT_IMAGEGW_HOME.as_os_str());
        }
    }

    Ok(())
}

/// Returns the imagegw home directory, honouring `IMAGEGW_HOME` when it is set.
pub fn get_imagegw_home_path() -> PathBuf {
    match env::var(IMAGEGW_HOME_ENV_VAR) {
        Ok(home) if !home.is_empty() => PathBuf::from(home),
        _ => DEFAULT_IMAGEGW_HOME.to_path_buf(),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    #[serial]
    fn test_home_path_follows_env_var() {
        unsafe {
            env::set_var(IMAGEGW_HOME_ENV_VAR, "/srv/imagegw");
        }
        assert_eq!(get_imagegw_home_path(), PathBuf::from("/srv/imagegw"));

        unsafe {
            env::set_var(IMAGEGW_HOME_ENV_VAR, "");
        }
        assert_eq!(get_imagegw_home_path(), DEFAULT_IMAGEGW_HOME.to_path_buf());

        unsafe {
            env::remove_var(IMAGEGW_HOME_ENV_VAR);
        }
    }

    #[test]
    #[serial]
    fn test_check_or_set_env_fills_missing_home() -> anyhow::Result<()> {
        unsafe {
            env::remove_var(IMAGEGW_HOME_ENV_VAR);
        }
        check_or_set_env()?;
        assert_eq!(
            env::var(IMAGEGW_HOME_ENV_VAR)?,
            DEFAULT_IMAGEGW_HOME.display().to_string()
        );

        unsafe {
            env::set_var(IMAGEGW_HOME_ENV_VAR, "/srv/imagegw");
        }
        check_or_set_env()?;
        assert_eq!(env::var(IMAGEGW_HOME_ENV_VAR)?, "/srv/imagegw");

        unsafe {
            env::remove_var(IMAGEGW_HOME_ENV_VAR);
        }

        Ok(())
    }
}
