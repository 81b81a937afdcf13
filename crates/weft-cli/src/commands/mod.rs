//! CLI subcommand implementations.

pub mod run;
pub mod skills;
pub mod validate;

use weft_core::workflow::schema::LogLevel;

/// Initialize tracing. `RUST_LOG` wins; otherwise `-v` or the workflow's
/// `execution.logging` level picks the filter.
pub fn init_tracing(verbose: bool, workflow_level: Option<LogLevel>) {
    let fallback = if verbose {
        "debug"
    } else {
        match workflow_level {
            Some(LogLevel::Quiet) => "warn",
            Some(LogLevel::Verbose) => "debug",
            _ => "info",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Load `.env.local` then `.env`; existing process variables win.
pub fn load_dotenv() {
    for filename in [".env.local", ".env"] {
        let path = std::path::Path::new(filename);
        if !path.exists() {
            continue;
        }
        let Ok(contents) = std::fs::read_to_string(path) else {
            continue;
        };
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(eq) = line.find('=') {
                let key = line[..eq].trim();
                let mut value = line[eq + 1..].trim().to_string();
                if (value.starts_with('"') && value.ends_with('"') && value.len() >= 2)
                    || (value.starts_with('\'') && value.ends_with('\'') && value.len() >= 2)
                {
                    value = value[1..value.len() - 1].to_string();
                }
                if std::env::var(key).is_err() {
                    std::env::set_var(key, &value);
                }
            }
        }
        tracing::debug!(file = filename, "loaded environment");
    }
}
