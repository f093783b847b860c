//! Environment file loading utilities

use std::path::Path;

/// Load environment variables from .env files in the application directory.
/// This loads .env first, then .env.{APP_ENV} if APP_ENV is set; the latter
/// overrides values from the former.
///
/// Call before the runtime starts worker threads.
pub fn load_env_files(folder: &Path) -> usize {
    let mut loaded = load_env_file(folder, ".env", false);

    if let Ok(app_env) = std::env::var("APP_ENV") {
        loaded += load_env_file(folder, &format!(".env.{}", app_env), true);
    }
    loaded
}

/// Load a single .env file, returning how many variables were set.
///
/// # Arguments
/// * `folder` - The directory containing the .env file
/// * `filename` - The name of the .env file
/// * `override_existing` - Whether to override existing environment variables
pub fn load_env_file(folder: &Path, filename: &str, override_existing: bool) -> usize {
    let env_file = folder.join(filename);
    let Ok(content) = std::fs::read_to_string(&env_file) else {
        return 0;
    };

    let mut loaded = 0;
    for (key, value) in parse_env(&content) {
        if override_existing || std::env::var(key).is_err() {
            std::env::set_var(key, value);
            loaded += 1;
        }
    }
    tracing::debug!(file = %env_file.display(), loaded, "loaded env file");
    loaded
}

/// `KEY=value` pairs, skipping blanks and `#` comments. Surrounding quotes are
/// stripped from values.
fn parse_env(content: &str) -> Vec<(&str, &str)> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| {
            let value = value.trim().trim_matches('"').trim_matches('\'');
            (key.trim(), value)
        })
        .collect()
}
