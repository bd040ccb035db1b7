//! Path to item resolution with a bounded-freshness cache.
//!
//! The cache maps normalized paths to [`CacheEntry`] snapshots. Entries are
//! plain data: every mutation the filesystem performs replaces or evicts
//! them using the server's response. A generation counter guards against a
//! lookup that started before a mutation writing its stale result back.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use graphfs_common::{DrivePath, Error, Result};

use crate::backend::{encode_segment, DriveLocator, ItemAddress};
use crate::client::DriveClient;
use crate::models::{ChildrenPage, DriveItemDto, RemoteItem};

/// Materialized children of a folder, possibly still missing later pages.
#[derive(Debug, Clone)]
pub struct Listing {
    pub items: Vec<RemoteItem>,
    /// Continuation of a partially fetched listing.
    pub next_link: Option<String>,
    pub fetched_at: Instant,
}

impl Listing {
    pub fn is_complete(&self) -> bool {
        self.next_link.is_none()
    }
}

/// Cached snapshot of one path.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub item: RemoteItem,
    pub fetched_at: Instant,
    pub children: Option<Listing>,
}

struct CacheState {
    entries: HashMap<DrivePath, CacheEntry>,
    generation: u64,
}

/// Maps drive paths to remote items.
pub struct ItemResolver {
    client: Arc<DriveClient>,
    locator: Arc<DriveLocator>,
    state: RwLock<CacheState>,
    freshness: Duration,
    page_size: u32,
}

impl ItemResolver {
    pub fn new(
        client: Arc<DriveClient>,
        locator: Arc<DriveLocator>,
        freshness: Duration,
        page_size: u32,
    ) -> Self {
        Self {
            client,
            locator,
            state: RwLock::new(CacheState {
                entries: HashMap::new(),
                generation: 0,
            }),
            freshness,
            page_size,
        }
    }

    fn is_fresh(&self, fetched_at: Instant) -> bool {
        fetched_at.elapsed() < self.freshness
    }

    async fn fresh_item(&self, path: &DrivePath) -> Option<RemoteItem> {
        let state = self.state.read().await;
        state
            .entries
            .get(path)
            .filter(|e| self.is_fresh(e.fetched_at))
            .map(|e| e.item.clone())
    }

    /// Cached entry for `path`, fresh or not.
    pub async fn cached(&self, path: &DrivePath) -> Option<CacheEntry> {
        self.state.read().await.entries.get(path).cloned()
    }

    /// Resolve a path to its remote item.
    ///
    /// Walks from the root one segment at a time, serving each step from
    /// the cache when fresh and otherwise from the parent's listing.
    ///
    /// # Errors
    /// - `NotFound` at the first segment that does not exist
    pub async fn resolve(&self, path: &DrivePath) -> Result<RemoteItem> {
        if let Some(item) = self.fresh_item(path).await {
            return Ok(item);
        }

        let mut current = self.resolve_root().await?;
        let mut current_path = DrivePath::root();

        for name in path.components() {
            let child_path = current_path.join(name)?;
            current = match self.fresh_item(&child_path).await {
                Some(item) => item,
                None => {
                    if !current.is_folder() {
                        return Err(Error::NotFound(child_path.to_string_path()));
                    }
                    let (_, found) = self
                        .fetch_listing(&current_path, &current, Some(name))
                        .await?;
                    found.ok_or_else(|| Error::NotFound(child_path.to_string_path()))?
                }
            };
            current_path = child_path;
        }

        Ok(current)
    }

    async fn resolve_root(&self) -> Result<RemoteItem> {
        let root = DrivePath::root();
        if let Some(item) = self.fresh_item(&root).await {
            return Ok(item);
        }

        let generation = self.state.read().await.generation;
        let url = self.locator.item_url(&ItemAddress::Root).await?;
        let dto: DriveItemDto = self.client.get_json(&url).await?;
        let item = dto.into_item(root.clone());

        let mut state = self.state.write().await;
        if state.generation == generation {
            let children = state.entries.get(&root).and_then(|e| e.children.clone());
            state.entries.insert(
                root,
                CacheEntry {
                    item: item.clone(),
                    fetched_at: Instant::now(),
                    children,
                },
            );
        }
        Ok(item)
    }

    /// List a folder's children, following every continuation.
    ///
    /// Listing a file yields the file itself.
    pub async fn list(&self, path: &DrivePath) -> Result<Vec<RemoteItem>> {
        let folder = self.resolve(path).await?;
        if !folder.is_folder() {
            return Ok(vec![folder]);
        }
        let (items, _) = self.fetch_listing(path, &folder, None).await?;
        Ok(items)
    }

    /// Listing with a server-side `$expand`; bypasses the cache because the
    /// expanded snapshots differ from the cached ones.
    pub async fn list_expanded(&self, path: &DrivePath, expand: &str) -> Result<Vec<RemoteItem>> {
        let folder = self.resolve(path).await?;
        if !folder.is_folder() {
            return Ok(vec![folder]);
        }

        let mut url = format!(
            "{}?$top={}&$expand={}",
            self.children_url(&folder).await?,
            self.page_size,
            encode_segment(expand)
        );
        let mut items = Vec::new();
        loop {
            let page: ChildrenPage = self.client.get_json(&url).await?;
            items.extend(page.value.into_iter().filter_map(|dto| to_child(path, dto)));
            match page.next_link {
                Some(next) => url = next,
                None => return Ok(items),
            }
        }
    }

    async fn children_url(&self, folder: &RemoteItem) -> Result<String> {
        self.locator
            .action_url(&ItemAddress::Id(folder.id.clone()), "children")
            .await
    }

    /// Page through a folder's children until `stop_at` is found or the
    /// listing is exhausted, reusing a fresh cached listing.
    ///
    /// Returns the materialized items so far and the child named `stop_at`.
    async fn fetch_listing(
        &self,
        folder_path: &DrivePath,
        folder: &RemoteItem,
        stop_at: Option<&str>,
    ) -> Result<(Vec<RemoteItem>, Option<RemoteItem>)> {
        let (generation, cached) = {
            let state = self.state.read().await;
            let cached = state
                .entries
                .get(folder_path)
                .filter(|e| e.item.id == folder.id)
                .and_then(|e| e.children.clone())
                .filter(|l| self.is_fresh(l.fetched_at));
            (state.generation, cached)
        };

        let (mut items, mut next_link, fetched_at) = match cached {
            Some(listing) => {
                let found = stop_at.and_then(|name| find_named(&listing.items, name));
                if found.is_some() || listing.is_complete() {
                    return Ok((listing.items, found));
                }
                (listing.items, listing.next_link, listing.fetched_at)
            }
            None => (Vec::new(), None, Instant::now()),
        };

        let mut url = match next_link.take() {
            Some(link) => link,
            None => format!("{}?$top={}", self.children_url(folder).await?, self.page_size),
        };

        let mut found = None;
        loop {
            debug!(path = %folder_path, "Listing folder page");
            let page: ChildrenPage = self.client.get_json(&url).await?;
            let page_items: Vec<RemoteItem> = page
                .value
                .into_iter()
                .filter_map(|dto| to_child(folder_path, dto))
                .collect();
            if let Some(name) = stop_at {
                found = find_named(&page_items, name);
            }
            items.extend(page_items);
            next_link = page.next_link;

            match &next_link {
                Some(next) if found.is_none() => url = next.clone(),
                _ => break,
            }
        }

        self.store_listing(
            folder_path,
            folder,
            Listing {
                items: items.clone(),
                next_link,
                fetched_at,
            },
            generation,
        )
        .await;

        Ok((items, found))
    }

    async fn store_listing(
        &self,
        folder_path: &DrivePath,
        folder: &RemoteItem,
        listing: Listing,
        generation: u64,
    ) {
        let mut state = self.state.write().await;
        if state.generation != generation {
            debug!(path = %folder_path, "Discarding listing fetched before a mutation");
            return;
        }

        let before = state.entries.len();
        state.entries.retain(|_, entry| {
            self.is_fresh(entry.fetched_at)
                || entry
                    .children
                    .as_ref()
                    .is_some_and(|l| self.is_fresh(l.fetched_at))
        });
        let pruned = before - state.entries.len();
        if pruned > 0 {
            debug!(pruned, "Pruned expired cache entries");
        }

        let now = Instant::now();
        for child in &listing.items {
            let children = state
                .entries
                .get(&child.path)
                .filter(|e| e.item.id == child.id)
                .and_then(|e| e.children.clone());
            state.entries.insert(
                child.path.clone(),
                CacheEntry {
                    item: child.clone(),
                    fetched_at: now,
                    children,
                },
            );
        }

        let entry = state
            .entries
            .entry(folder_path.clone())
            .or_insert_with(|| CacheEntry {
                item: folder.clone(),
                fetched_at: now,
                children: None,
            });
        entry.children = Some(listing);
    }

    /// Record an item the server just returned for a write.
    ///
    /// The parent's listing is dropped so the next listing refetches it.
    pub async fn record_item(&self, item: RemoteItem) {
        let mut state = self.state.write().await;
        state.generation += 1;

        let path = item.path.clone();
        let previous_id = state.entries.get(&path).map(|e| e.item.id.clone());
        let children = match previous_id {
            Some(id) if id == item.id => state.entries.get(&path).and_then(|e| e.children.clone()),
            Some(_) => {
                // a different item now lives here
                state.entries.retain(|k, _| !k.starts_with(&path) || *k == path);
                None
            }
            None => None,
        };

        debug!(path = %path, item_id = %item.id, "Caching written item");
        state.entries.insert(
            path.clone(),
            CacheEntry {
                item,
                fetched_at: Instant::now(),
                children,
            },
        );
        if let Some(parent) = path.parent() {
            drop_listing(&mut state, &parent);
        }
    }

    /// Re-key a moved item and everything cached below it.
    ///
    /// `item` is the server's response, located at the new path.
    pub async fn record_move(&self, from: &DrivePath, item: RemoteItem) {
        let to = item.path.clone();
        let mut state = self.state.write().await;
        state.generation += 1;

        let moved_keys: Vec<DrivePath> = state
            .entries
            .keys()
            .filter(|k| k.starts_with(from))
            .cloned()
            .collect();
        let mut moved = Vec::with_capacity(moved_keys.len());
        for key in moved_keys {
            if let Some(entry) = state.entries.remove(&key) {
                moved.push((key, entry));
            }
        }
        // whatever was at the destination is gone
        state.entries.retain(|k, _| !k.starts_with(&to));

        for (key, mut entry) in moved {
            let Some(new_key) = key.rebase(from, &to) else {
                continue;
            };
            entry.item = if key == *from {
                item.clone()
            } else {
                entry.item.relocated(new_key.clone())
            };
            if let Some(listing) = entry.children.as_mut() {
                for child in listing.items.iter_mut() {
                    if let Some(child_path) = child.path.rebase(from, &to) {
                        *child = child.relocated(child_path);
                    }
                }
            }
            state.entries.insert(new_key, entry);
        }

        if !state.entries.contains_key(&to) {
            state.entries.insert(
                to.clone(),
                CacheEntry {
                    item,
                    fetched_at: Instant::now(),
                    children: None,
                },
            );
        }

        debug!(from = %from, to = %to, "Re-keyed moved item");
        if let Some(parent) = from.parent() {
            drop_listing(&mut state, &parent);
        }
        if let Some(parent) = to.parent() {
            drop_listing(&mut state, &parent);
        }
    }

    /// Forget a path the server confirmed deleted, and everything below it.
    ///
    /// The path is also removed from the parent's listing.
    pub async fn evict(&self, path: &DrivePath) {
        let mut state = self.state.write().await;
        state.generation += 1;
        state.entries.retain(|k, _| !k.starts_with(path));

        if let Some(parent) = path.parent() {
            if let Some(listing) = state
                .entries
                .get_mut(&parent)
                .and_then(|e| e.children.as_mut())
            {
                listing.items.retain(|child| child.path != *path);
            }
        }
        debug!(path = %path, "Evicted path from cache");
    }

    /// Forget `path` and everything below it without assuming it is gone.
    ///
    /// Used when an operation failed with an unknown outcome: the parent's
    /// listing is dropped too, so the next lookup asks the server.
    pub async fn forget(&self, path: &DrivePath) {
        let mut state = self.state.write().await;
        state.generation += 1;
        state.entries.retain(|k, _| !k.starts_with(path));
        if let Some(parent) = path.parent() {
            drop_listing(&mut state, &parent);
        }
        debug!(path = %path, "Forgot path of unknown state");
    }

    /// Drop the snapshot of `path` whose server state changed in place.
    pub async fn invalidate(&self, path: &DrivePath) {
        let mut state = self.state.write().await;
        state.generation += 1;
        state.entries.remove(path);
        if let Some(parent) = path.parent() {
            drop_listing(&mut state, &parent);
        }
    }

    /// Forget everything.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.generation += 1;
        state.entries.clear();
    }
}

fn drop_listing(state: &mut CacheState, folder: &DrivePath) {
    if let Some(entry) = state.entries.get_mut(folder) {
        entry.children = None;
    }
}

fn find_named(items: &[RemoteItem], name: &str) -> Option<RemoteItem> {
    items.iter().find(|item| item.name == name).cloned()
}

fn to_child(folder_path: &DrivePath, dto: DriveItemDto) -> Option<RemoteItem> {
    let name = dto.name.clone()?;
    let path = folder_path.join(&name).ok()?;
    Some(dto.into_item(path))
}
