//! The engine-managed image cache.
//!
//! `resource.image_cache.default` never appears in a blueprint. The binder
//! creates it ahead of user resources, appends every network that comes up
//! to its `depends_on`, and schedules one `refresh` per bound network so the
//! provider can attach the cache to it. Refreshes are serialized. When no
//! provider is registered for `image_cache` the binder does nothing.

use crate::executor::{Job, Landing, Step};
use drydock_schema::{
    compute_checksum, Config, Resource, ResourceId, Status, IMAGE_CACHE_ID, TYPE_IMAGE_CACHE,
    TYPE_NETWORK,
};
use tracing::debug;

/// A fresh image cache declaration.
pub fn image_cache_resource() -> Resource {
    let mut r = Resource::new("", TYPE_IMAGE_CACHE, "default");
    r.meta.checksum.parsed = compute_checksum(&r);
    r
}

#[derive(Debug, Default)]
pub(crate) struct CacheBinder {
    active: bool,
    queued: Option<Job>,
    creating: bool,
    refreshing: bool,
    pending: usize,
    refreshed: bool,
    needs_refresh: bool,
}

impl CacheBinder {
    pub(crate) fn new(active: bool) -> Self {
        Self {
            active,
            ..Self::default()
        }
    }

    /// Queue the create (or recreate) of the cache if state lacks a healthy
    /// one. Networks already up are bound to the new cache straight away.
    pub(crate) fn prepare(&mut self, state: &mut Config) {
        if !self.active {
            return;
        }
        let prior = state.get(IMAGE_CACHE_ID).cloned();
        if prior.as_ref().and_then(Resource::status) == Some(Status::Created) {
            self.needs_refresh = true;
            return;
        }

        let mut cache = image_cache_resource();
        let networks: Vec<ResourceId> = state
            .find_by_type(TYPE_NETWORK)
            .filter(|n| n.status() == Some(Status::Created))
            .map(|n| n.id().clone())
            .collect();
        for id in networks {
            cache.add_dependency(id);
        }
        self.needs_refresh = !cache.meta.depends_on.is_empty();

        let steps = match &prior {
            None => vec![Step::Create],
            Some(_) => vec![Step::Destroy { strict: false }, Step::Create],
        };
        if let Some(entry) = state.get_mut(IMAGE_CACHE_ID) {
            entry.meta.depends_on.clone_from(&cache.meta.depends_on);
        }
        debug!(
            "scheduling image cache {} with {} network(s)",
            if prior.is_some() { "recreate" } else { "create" },
            cache.meta.depends_on.len()
        );
        self.queued = Some(
            Job::new(cache, steps, Landing::Status(Status::Created))
                .with_prior(prior)
                .for_cache(),
        );
    }

    /// While the cache create is outstanding no user resource may start.
    pub(crate) fn blocks(&self) -> bool {
        self.queued.is_some() || self.creating
    }

    /// The next cache job to dispatch, if one is due and none is running.
    pub(crate) fn next_job(&mut self, state: &Config) -> Option<Job> {
        if !self.active {
            return None;
        }
        if let Some(job) = self.queued.take() {
            self.creating = true;
            return Some(job);
        }
        if self.creating || self.refreshing || self.pending == 0 {
            return None;
        }
        let Some(cache) = state
            .get(IMAGE_CACHE_ID)
            .filter(|c| c.status() == Some(Status::Created))
        else {
            self.pending = 0;
            return None;
        };
        self.pending -= 1;
        self.refreshing = true;
        self.refreshed = true;
        Some(Job::new(cache.clone(), vec![Step::Refresh], Landing::Status(Status::Created)).for_cache())
    }

    /// A cache job finished, whatever its outcome.
    pub(crate) fn finished(&mut self) {
        self.creating = false;
        self.refreshing = false;
    }

    /// Record a network that just came up and owe the cache a refresh.
    pub(crate) fn bind(&mut self, state: &mut Config, network: &ResourceId) {
        if !self.active {
            return;
        }
        let Some(cache) = state.get_mut(IMAGE_CACHE_ID) else {
            return;
        };
        cache.add_dependency(network.clone());
        if cache.status() == Some(Status::Created) {
            debug!("binding {network} to image cache");
            self.pending += 1;
        }
    }

    /// Drop a network that went away from the cache's dependencies.
    pub(crate) fn unbind(&mut self, state: &mut Config, network: &ResourceId) {
        let Some(cache) = state.get_mut(IMAGE_CACHE_ID) else {
            return;
        };
        let before = cache.meta.depends_on.len();
        cache.meta.depends_on.retain(|d| d != network);
        if cache.meta.depends_on.len() != before && cache.status() == Some(Status::Created) {
            debug!("unbinding {network} from image cache");
            self.needs_refresh = true;
        }
    }

    /// Owe one final refresh when the cache's network set may have changed
    /// this run without a refresh having happened yet.
    pub(crate) fn request_final_refresh(&mut self, state: &Config) {
        let created = state
            .get(IMAGE_CACHE_ID)
            .is_some_and(|c| c.status() == Some(Status::Created));
        if self.active && self.needs_refresh && !self.refreshed && created {
            self.pending += 1;
        }
    }
}
