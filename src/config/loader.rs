use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use regex::Regex;
use std::path::Path;

use super::schema::Settings;
use crate::error::{ConfigError, Result};

const ENV_PREFIX: &str = "EGRESS_";

fn base() -> Figment {
    Figment::from(Serialized::defaults(Settings::default()))
}

/// Defaults, then `egress.{toml,yaml,yml,json}` in the working directory,
/// then `EGRESS_` variables (`__` separates sections).
pub fn load() -> Result<Settings> {
    let settings: Settings = base()
        .merge(Toml::file("egress.toml"))
        .merge(Yaml::file("egress.yaml"))
        .merge(Yaml::file("egress.yml"))
        .merge(Json::file("egress.json"))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    finish(settings)
}

pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Settings> {
    let path = path.as_ref();
    let figment = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => base().merge(Toml::file(path)),
        Some("json") => base().merge(Json::file(path)),
        Some("yaml") | Some("yml") => base().merge(Yaml::file(path)),
        _ => {
            return Err(ConfigError::Parse(
                "Unsupported config file format. Use .toml, .json, .yaml, or .yml".into(),
            )
            .into())
        }
    };
    if !path.exists() {
        return Err(ConfigError::Parse(format!("{} does not exist", path.display())).into());
    }

    let settings: Settings = figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    finish(settings)
}

fn finish(settings: Settings) -> Result<Settings> {
    let settings = apply_env_substitutions(settings)?;
    validate(&settings)?;
    Ok(settings)
}

pub fn validate(settings: &Settings) -> Result<()> {
    let remote = url::Url::parse(&settings.local.remote)
        .map_err(|e| ConfigError::Validation(format!("local.remote is not a URL: {e}")))?;
    if !matches!(remote.scheme(), "http" | "https") {
        return Err(ConfigError::Validation(format!(
            "local.remote must be http or https, got {}",
            remote.scheme()
        ))
        .into());
    }

    if settings.local.max_replay_body_bytes == 0 {
        return Err(ConfigError::Validation(
            "local.max_replay_body_bytes must be greater than 0".into(),
        )
        .into());
    }

    for (name, value) in [
        ("local.direct_timeout_ms", settings.local.direct_timeout_ms),
        ("local.relay_timeout_ms", settings.local.relay_timeout_ms),
        ("relay.dial_timeout_ms", settings.relay.dial_timeout_ms),
    ] {
        if value == 0 {
            return Err(ConfigError::Validation(format!("{name} must be greater than 0")).into());
        }
    }

    if matches!(settings.relay.secret.as_deref(), Some("")) {
        return Err(ConfigError::Validation("relay.secret must not be empty".into()).into());
    }

    Ok(())
}

fn apply_env_substitutions(mut settings: Settings) -> Result<Settings> {
    settings.local.remote = substitute_env_vars(&settings.local.remote)?;
    if let Some(secret) = &mut settings.relay.secret {
        *secret = substitute_env_vars(secret)?;
    }
    Ok(settings)
}

/// Expands `${VAR}` and `${VAR:-default}`.
fn substitute_env_vars(input: &str) -> Result<String> {
    let re = Regex::new(r"\$\{([^}]+)\}").map_err(|e| ConfigError::Parse(e.to_string()))?;
    let mut result = input.to_string();

    for cap in re.captures_iter(input) {
        let expr = &cap[1];
        let (name, default) = match expr.split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (expr, None),
        };
        let value = match (std::env::var(name), default) {
            (Ok(value), _) => value,
            (Err(_), Some(default)) => default.to_string(),
            (Err(_), None) => {
                return Err(ConfigError::EnvVar(format!(
                    "Environment variable '{name}' not found"
                ))
                .into())
            }
        };
        result = result.replace(&cap[0], &value);
    }

    Ok(result)
}
