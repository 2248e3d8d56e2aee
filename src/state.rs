use std::sync::Arc;

use anyhow::Result;
use handlebars::Handlebars;
use tokio::sync::Notify;

use crate::config::Config;
use crate::feed::FeedChecker;
use crate::layout::{LayoutCache, LayoutResolver, LAYOUT_CACHE_CAPACITY};
use crate::storage::Storage;
use crate::template;

#[derive(Clone)]
pub struct State {
    pub storage: Arc<Storage>,
    pub cfg: Arc<Config>,
    pub checker: Arc<FeedChecker>,
    pub layout: Arc<LayoutResolver>,
    pub wake_up: Arc<Notify>,
    pub template: Arc<Handlebars<'static>>,
}

impl State {
    pub async fn new(cfg: Config) -> Result<Self> {
        let storage = Arc::new(Storage::new(&cfg.db_path).await?);

        Self::with_storage(cfg, storage)
    }

    pub fn with_storage(cfg: Config, storage: Arc<Storage>) -> Result<Self> {
        let checker = Arc::new(FeedChecker::new(
            cfg.admin_notification.clone(),
            storage.clone(),
        )?);
        let layout = Arc::new(LayoutResolver::new(
            storage.clone(),
            Arc::new(LayoutCache::new("layout", LAYOUT_CACHE_CAPACITY)),
        ));
        let cfg = Arc::new(cfg);
        let template = Arc::new(template::new()?);

        Ok(State {
            storage,
            cfg,
            checker,
            layout,
            wake_up: Arc::new(Notify::new()),
            template,
        })
    }
}
