//! The mirror refinement of `ArchiveTree::get_path`.
//!
//! A branch whose configuration names an `upstream_url` lazily fetches what
//! it is missing: a stale or absent package index is refreshed from the
//! upstream's gzipped copy, and misses under `authors/id/` are fetched on
//! demand. Fetched blobs are mirrored into the shared dist cache and
//! enqueued for a delayed batched commit.

use std::rc::Rc;

use anyhow::Result;
use git2::Oid;
use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};

use cpangit_domain::scan_last_updated;

use crate::gitstore::FILEMODE_BLOB;
use crate::tree::archive::{ArchiveTree, AUTHORS_PREFIX, PACKAGE_DETAILS_PATH};
use crate::upstream::{gunzip, join_url, UpstreamError, UserAgent};

const PACKAGE_DETAILS_GZ: &str = "modules/02packages.details.txt.gz";

struct MirrorSettings {
    upstream_url: String,
    max_age: u64,
    agent: Rc<dyn UserAgent>,
}

impl ArchiveTree {
    /// Autofetch settings, present only when this tree mirrors an upstream,
    /// autofetch is enabled, and an agent is attached.
    fn mirror_settings(&mut self) -> Result<Option<MirrorSettings>> {
        let Some(agent) = self.agent().cloned() else {
            return Ok(None);
        };
        let Some(config) = self.config_opt()? else {
            return Ok(None);
        };
        if !config.autofetch_enabled() {
            return Ok(None);
        }
        let Some(upstream_url) = config.upstream_url.clone() else {
            return Ok(None);
        };
        let max_age = config.package_details_max_age();
        Ok(Some(MirrorSettings {
            upstream_url,
            max_age,
            agent,
        }))
    }

    pub(super) fn get_path_autofetch(&mut self, path: &str) -> Result<Option<(Oid, i32)>> {
        if path == PACKAGE_DETAILS_PATH {
            self.refresh_package_details_if_stale()?;
        } else if let Some(author_path) = path.strip_prefix(AUTHORS_PREFIX) {
            if self.tree().get_path(path)?.is_none() {
                self.autofetch_dist(author_path)?;
            }
        }
        self.tree().get_path(path)
    }

    fn refresh_package_details_if_stale(&mut self) -> Result<()> {
        let Some(settings) = self.mirror_settings()? else {
            return Ok(());
        };
        let stale = match self.tree().get_path(PACKAGE_DETAILS_PATH)? {
            None => true,
            Some((oid, _)) => {
                let last_update = match self.fetched_at(oid) {
                    Some(at) => Some(at),
                    None => scan_last_updated(&self.tree().store().read_blob(oid)?),
                };
                match last_update {
                    Some(at) => {
                        at < OffsetDateTime::now_utc() - Duration::seconds(settings.max_age as i64)
                    }
                    // Unknown age is infinitely stale.
                    None => true,
                }
            }
        };
        if stale {
            self.fetch_upstream_package_details(&settings)?;
        }
        Ok(())
    }

    fn fetch_upstream_package_details(&mut self, settings: &MirrorSettings) -> Result<Oid> {
        let url = join_url(&settings.upstream_url, PACKAGE_DETAILS_GZ);
        let response = settings.agent.get(&url)?;
        if !response.is_success() {
            return Err(UpstreamError::Status {
                status: response.status,
                url,
            }
            .into());
        }
        let text = gunzip(&response.body)?;
        let oid = self.tree_mut().write(PACKAGE_DETAILS_PATH, &text)?;
        self.invalidate(PACKAGE_DETAILS_PATH);
        self.note_fetched(oid, OffsetDateTime::now_utc());
        self.schedule_commit(PACKAGE_DETAILS_PATH, oid);
        debug!(url, %oid, "refreshed package details from upstream");
        Ok(oid)
    }

    fn autofetch_dist(&mut self, author_path: &str) -> Result<Option<Oid>> {
        let Some(settings) = self.mirror_settings()? else {
            return Ok(None);
        };
        self.fetch_upstream_dist(&settings, author_path)
    }

    fn fetch_upstream_dist(
        &mut self,
        settings: &MirrorSettings,
        author_path: &str,
    ) -> Result<Option<Oid>> {
        let url = join_url(
            &settings.upstream_url,
            &format!("{AUTHORS_PREFIX}{author_path}"),
        );
        let response = settings.agent.get(&url)?;
        if response.status == 404 {
            debug!(url, "upstream has no such dist");
            return Ok(None);
        }
        if !response.is_success() {
            return Err(UpstreamError::Status {
                status: response.status,
                url,
            }
            .into());
        }
        let path = format!("{AUTHORS_PREFIX}{author_path}");
        let oid = self.tree_mut().write(&path, &response.body)?;
        self.schedule_commit(&path, oid);
        if let Some(cache) = self.dist_cache().cloned() {
            let mut cache = cache.borrow_mut();
            cache.tree_mut().stage_blob(&path, oid, FILEMODE_BLOB)?;
            cache.schedule_commit(&path, oid);
        }
        debug!(url, %oid, "fetched dist from upstream");
        Ok(Some(oid))
    }

    pub(crate) fn schedule_commit(&mut self, path: &str, oid: Oid) {
        let Some(committer) = self.committer().cloned() else {
            return;
        };
        let Some(branch) = self.branch().map(str::to_string) else {
            // Unattached mirrors stage only; committing is the caller's
            // problem.
            return;
        };
        let snapshot = self.tree().snapshot();
        if let Err(err) = committer.schedule(&branch, snapshot, path, oid, FILEMODE_BLOB) {
            warn!(branch, path, error = %err, "failed to schedule delayed commit");
        }
    }
}
