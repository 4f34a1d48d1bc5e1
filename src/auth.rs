//! Project and credential discovery
//!
//! Both values are resolved once at startup. Explicit input wins, then
//! environment variables, then the local `gcloud` configuration.

use crate::error::{RescueError, Result};
use std::env;
use std::process::{Command, Stdio};
use tracing::debug;

/// Environment variables checked for the project id, in order
pub const PROJECT_ENV_VARS: [&str; 2] = ["CLOUDSDK_CORE_PROJECT", "GOOGLE_CLOUD_PROJECT"];

/// Environment variable holding a ready-made OAuth2 access token
pub const TOKEN_ENV_VAR: &str = "GCE_RESCUE_ACCESS_TOKEN";

/// Run `gcloud <args>` and return trimmed stdout.
fn gcloud(args: &[&str]) -> Result<String> {
    debug!("running gcloud {}", args.join(" "));
    let output = Command::new("gcloud")
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| RescueError::auth(format!("unable to run gcloud: {}", e)))?;

    if !output.status.success() {
        return Err(RescueError::auth(format!(
            "gcloud {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// `gcloud` prints `(unset)` or nothing for missing properties.
fn non_empty(value: String) -> Option<String> {
    let value = value.trim();
    (!value.is_empty() && value != "(unset)").then(|| value.to_string())
}

fn resolve_project_with<E, G>(flag: Option<&str>, env_lookup: E, run_gcloud: G) -> Result<String>
where
    E: Fn(&str) -> Option<String>,
    G: Fn(&[&str]) -> Result<String>,
{
    if let Some(project) = flag.map(str::to_string).and_then(non_empty) {
        return Ok(project);
    }
    for var in PROJECT_ENV_VARS {
        if let Some(project) = env_lookup(var).and_then(non_empty) {
            debug!("project {} from {}", project, var);
            return Ok(project);
        }
    }
    run_gcloud(&["config", "get-value", "project"])
        .ok()
        .and_then(non_empty)
        .ok_or_else(|| {
            RescueError::auth("no project configured; pass --project or run `gcloud config set project`")
        })
}

fn access_token_with<E, G>(env_lookup: E, run_gcloud: G) -> Result<String>
where
    E: Fn(&str) -> Option<String>,
    G: Fn(&[&str]) -> Result<String>,
{
    if let Some(token) = env_lookup(TOKEN_ENV_VAR).and_then(non_empty) {
        debug!("access token from {}", TOKEN_ENV_VAR);
        return Ok(token);
    }
    non_empty(run_gcloud(&["auth", "print-access-token"])?)
        .ok_or_else(|| RescueError::auth("gcloud returned an empty access token"))
}

/// Resolve the project id.
pub fn resolve_project(flag: Option<&str>) -> Result<String> {
    resolve_project_with(flag, |var| env::var(var).ok(), gcloud)
}

/// Obtain a bearer token for the Compute API.
pub fn access_token() -> Result<String> {
    access_token_with(|var| env::var(var).ok(), gcloud)
}
