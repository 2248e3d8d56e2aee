mod types;

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use take_mut::take;
use tracing::{debug, info};

pub use self::types::*;

fn default_poll_interval() -> Duration {
    Config::default().poll_interval
}

fn default_max_initial_check_sleep() -> Duration {
    Config::default().max_initial_check_sleep
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    pub bind_addr: String,
    pub db_path: PathBuf,

    #[serde(default)]
    pub admin_notification: NotificationConfig,

    #[serde(default = "default_poll_interval")]
    pub poll_interval: Duration,

    #[serde(default = "default_max_initial_check_sleep")]
    pub max_initial_check_sleep: Duration,
}

impl Config {
    pub fn update(&mut self, args: &crate::cli::Args) {
        fn set_if_some<T: Clone>(dst: &mut T, v: &Option<T>) {
            if let Some(v) = v {
                *dst = v.clone();
            }
        }

        set_if_some(&mut self.bind_addr, &args.bind_addr);
        set_if_some(&mut self.db_path, &args.db_path);
    }

    pub fn resolve_relative_paths(&mut self, config_dir: impl AsRef<Path>) {
        let config_dir = config_dir.as_ref();

        // rebuilt field by field so that a new path-like field cannot be forgotten here.
        take(self, |this| Self {
            bind_addr: this.bind_addr,
            db_path: config_dir.join(&this.db_path),
            admin_notification: this.admin_notification,
            poll_interval: this.poll_interval,
            max_initial_check_sleep: this.max_initial_check_sleep,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_addr: "127.0.0.1:20655".into(),
            db_path: "./notifeed.sqlite3".into(),
            admin_notification: Default::default(),
            poll_interval: Duration::from_secs(900),
            max_initial_check_sleep: Duration::from_secs(10),
        }
    }
}

/// Settings of the admin notification feed.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct NotificationConfig {
    /// Whether the feed is requested over `https://` rather than `http://`.
    pub use_https: bool,

    /// Host and path of the feed, without the scheme.
    pub feed_url: String,

    /// Minimum number of hours between two checks. Zero or negative disables throttling.
    pub frequency: i64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            use_https: true,
            feed_url: "notifications.example.com/feed.rss".into(),
            frequency: 1,
        }
    }
}

pub fn load(search_paths: &[PathBuf]) -> Result<Config> {
    for path in search_paths {
        debug!("Trying to load {}", path.display());
        let mut contents = String::new();

        {
            let mut f = match File::open(path) {
                Ok(f) => f,

                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(file = %path.display(), "File not found, skipping");
                    continue;
                }

                Err(e) => {
                    return Err(e)
                        .context(anyhow!("could not open the config file `{}`", path.display()));
                }
            };

            f.read_to_string(&mut contents).with_context(|| {
                anyhow!(
                    "could not read the contents of the config file `{}`",
                    path.display()
                )
            })?;
        }

        let mut cfg = parse(&contents)
            .with_context(|| anyhow!("could not load the config file `{}`", path.display()))?;

        if let Some(parent) = path.parent() {
            cfg.resolve_relative_paths(parent);
        }

        info!("Loaded the config file `{}`", path.display());

        return Ok(cfg);
    }

    info!("Using the default config");

    Ok(Default::default())
}

fn parse(contents: &str) -> Result<Config> {
    Ok(toml::from_str(contents)?)
}
