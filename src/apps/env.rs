//! Launch environment composition.
//!
//! Layers, later entries overriding earlier ones:
//! static session variables, template settings, caller-supplied variables,
//! locale, per-app overrides, then GPU device variables.

use std::collections::BTreeMap;

use super::{AppTemplate, InstalledApp};
use crate::core::Gpu;

/// Environment variable naming the URL a session should open.
pub const URL_VAR: &str = "SEALSKIN_URL";

/// Environment variable naming the file a session should open.
pub const FILE_VAR: &str = "SEALSKIN_FILE";

/// Inputs to environment composition that do not come from the app config.
#[derive(Debug, Clone)]
pub struct StaticEnv<'a> {
    /// Session id, becomes `SUBFOLDER=/<id>/`.
    pub session_id: &'a str,
    /// Container user id.
    pub puid: u32,
    /// Container group id.
    pub pgid: u32,
    /// Per-session basic-auth username.
    pub custom_user: &'a str,
    /// Per-session basic-auth password.
    pub password: &'a str,
}

/// Coerce a template setting value into an environment string.
fn coerce(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .unwrap_or_default()
            .trim_end()
            .to_owned(),
    }
}

/// Compose the container environment for one launch.
#[must_use]
pub fn compose(
    statics: &StaticEnv<'_>,
    template: Option<&AppTemplate>,
    extra: &BTreeMap<String, String>,
    language: Option<&str>,
    app: &InstalledApp,
    gpu: Option<&Gpu>,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert(
        "SUBFOLDER".to_owned(),
        format!("/{}/", statics.session_id),
    );
    env.insert("PUID".to_owned(), statics.puid.to_string());
    env.insert("PGID".to_owned(), statics.pgid.to_string());
    env.insert("CUSTOM_USER".to_owned(), statics.custom_user.to_owned());
    env.insert("PASSWORD".to_owned(), statics.password.to_owned());

    if let Some(template) = template {
        for (key, value) in &template.settings {
            env.insert(key.clone(), coerce(value));
        }
    }

    for (key, value) in extra {
        env.insert(key.clone(), value.clone());
    }

    if let Some(lang) = language {
        if !lang.eq_ignore_ascii_case("en_us.utf-8") {
            env.insert("LC_ALL".to_owned(), lang.to_owned());
        }
    }

    for var in &app.provider_config.env {
        env.insert(var.name.clone(), var.value.clone());
    }

    if let Some(Gpu::Dri3 { device }) = gpu {
        env.insert("DRI_NODE".to_owned(), device.clone());
        env.insert("DRINODE".to_owned(), device.clone());
    }

    env
}
