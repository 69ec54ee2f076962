use std::fs::read_to_string;
use std::path::Path;

use anyhow::{anyhow, Context};
use secrecy::SecretString;

use super::settings::{Config, Secrets};

/// Overrides config file values with environment variables, looked up through `env`.
pub fn apply_env_overrides<F>(config: &mut Config, env: F) -> anyhow::Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let non_empty = |key: &str| env(key).filter(|value| !value.trim().is_empty());

    if let Some(port) = non_empty("PORT") {
        config.server.port = port
            .trim()
            .parse()
            .with_context(|| format!("PORT '{}' is not a valid port", port))?;
    }
    if let Some(redirect_uri) = non_empty("REDIRECT_URI") {
        config.oauth.redirect_uri = Some(redirect_uri);
    }
    if let Some(auth_url) = non_empty("AUTH_URL") {
        config.oauth.auth_url = auth_url;
    }
    if let Some(token_url) = non_empty("TOKEN_URL") {
        config.oauth.token_url = token_url;
    }
    if let Some(api_url) = non_empty("OSM_API_URL") {
        config.osm.api_url = api_url;
    }
    if let Some(overpass_url) = non_empty("OVERPASS_URL") {
        config.overpass.url = overpass_url;
    }
    if let Some(comment) = non_empty("CHANGESET_COMMENT") {
        config.changesets.comment = comment;
    }
    if let Some(created_by) = non_empty("CREATED_BY") {
        config.changesets.created_by = created_by;
    }
    if let Some(query) = non_empty("QUERY") {
        let layer = config
            .layers
            .first_mut()
            .ok_or_else(|| anyhow!("QUERY is set but no layer is configured"))?;
        log::info!("Using QUERY from the environment for layer '{}'", layer.name);
        layer.query = query;
    }
    Ok(())
}

pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
    Ok(serde_yaml::from_str(contents)?)
}

/// Reads the YAML config file and applies environment overrides.
pub fn load_config(filepath: &Path) -> anyhow::Result<Config> {
    if !filepath.exists() {
        return Err(anyhow!("Config file {:?} not found", filepath));
    }
    let contents = read_to_string(filepath)?;
    let mut config =
        parse_config(&contents).with_context(|| format!("Could not parse {:?}", filepath))?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

pub fn load_secrets<F>(env: F) -> anyhow::Result<Secrets>
where
    F: Fn(&str) -> Option<String>,
{
    let required = |key: &str| {
        env(key)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| anyhow!("{} is not set in the environment variables", key))
    };
    let secrets = Secrets {
        client_id: required("CLIENT_ID")?,
        client_secret: SecretString::from(required("CLIENT_SECRET")?),
        session_secret: SecretString::from(required("SESSION_SECRET")?),
    };
    secrets.validate()?;
    Ok(secrets)
}
