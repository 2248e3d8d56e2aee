use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::cache::CacheRegion;
use crate::storage::{Storage, Tx};

/// A create/update request for a layout fragment.
///
/// `store_id`, `theme_id` and `is_temporary` describe the scope link to create along with the
/// fragment; they are not stored on the fragment itself.
#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LayoutUpdate {
    #[serde(default)]
    pub layout_update_id: Option<i64>,

    pub handle: String,

    #[serde(default)]
    pub xml: String,

    #[serde(default)]
    pub sort_order: i64,

    #[serde(default)]
    pub store_id: Option<i64>,

    #[serde(default)]
    pub theme_id: Option<i64>,

    #[serde(default)]
    pub is_temporary: bool,
}

impl LayoutUpdate {
    /// The `(store_id, theme_id)` scope, if both are present.
    pub fn scope(&self) -> Option<(i64, i64)> {
        Some((self.store_id?, self.theme_id?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FragmentKey {
    pub handle: String,
    pub theme_id: i64,
    pub store_id: i64,
    pub include_temporary: bool,
}

pub type LayoutCache = CacheRegion<FragmentKey, String>;

/// Upper bound on the number of resolved `(handle, theme, store)` lookups kept in memory.
pub const LAYOUT_CACHE_CAPACITY: u64 = 4096;

pub struct LayoutResolver {
    storage: Arc<Storage>,
    cache: Arc<LayoutCache>,
}

impl LayoutResolver {
    pub fn new(storage: Arc<Storage>, cache: Arc<LayoutCache>) -> Self {
        Self { storage, cache }
    }

    /// Concatenates the xml of every fragment linked to `handle` for the theme and for either the
    /// store or the default store, in ascending sort order.
    ///
    /// A fragment linked to both the default store and `store_id` appears twice. Returns an empty
    /// string when the database cannot be reached.
    #[instrument(level = "DEBUG", skip(self))]
    pub async fn resolve_fragments(
        &self,
        handle: &str,
        theme_id: i64,
        store_id: i64,
        include_temporary: bool,
    ) -> Result<String> {
        let mut tx = match self.storage.begin().await {
            Ok(tx) => tx,

            Err(e) => {
                warn!("No database connection to resolve layout updates with: {e:#}");

                return Ok(String::new());
            }
        };

        let fragments = tx
            .fetch_updates_by_handle(handle, theme_id, store_id, include_temporary)
            .await?;
        tx.commit().await?;

        debug!(count = fragments.len(), "Resolved layout updates");

        Ok(fragments.concat())
    }

    /// Same as [`Self::resolve_fragments`], served from the layout cache region when possible.
    pub async fn cached_fragments(&self, key: FragmentKey) -> Result<String> {
        if let Some(xml) = self.cache.get(&key).await {
            return Ok(xml);
        }

        let generation = self.cache.generation();
        let xml = self
            .resolve_fragments(&key.handle, key.theme_id, key.store_id, key.include_temporary)
            .await?;

        if !self.cache.insert(key, xml.clone(), generation).await {
            debug!("The layout cache was cleaned during resolution, not caching the result");
        }

        Ok(xml)
    }

    /// Creates or updates a fragment along with its scope link. Returns the fragment id.
    #[instrument(level = "DEBUG", skip(self, update), fields(handle = %update.handle))]
    pub async fn save_layout_update(&self, update: &LayoutUpdate) -> Result<i64> {
        let mut tx = self.storage.begin().await?;
        let layout_update_id = tx
            .save_layout_update(update)
            .await
            .context("could not save the layout update")?;

        self.persist_scope_link(tx, layout_update_id, update).await?;

        Ok(layout_update_id)
    }

    /// Links the saved fragment to its scope if the change set has one, commits `tx`, then cleans
    /// the whole layout cache region. The clean happens even when there was nothing to link.
    ///
    /// Returns whether a link was written.
    pub async fn persist_scope_link(
        &self,
        mut tx: Tx,
        layout_update_id: i64,
        update: &LayoutUpdate,
    ) -> Result<bool> {
        let linked = match update.scope() {
            Some((store_id, theme_id)) => {
                tx.upsert_layout_link(store_id, theme_id, layout_update_id, update.is_temporary)
                    .await?;

                true
            }

            None => {
                debug!(layout_update_id, "No store/theme scope given, not linking");

                false
            }
        };

        tx.commit().await?;
        self.cache.clean();

        Ok(linked)
    }
}
