//! Per-prefix fetch decision and the transparent streaming writer.

use crate::proxy::response::{
    find_header, BlobBody, Body, GuardedStream, PathGuard, ResponseWrapper, CACHE_HIT, CACHE_MISS,
    CACHE_WAIT,
};
use crate::proxy::rule::{ReplaceRule, Rule, RuleError};
use crate::proxy::upstream::{Transport, UpstreamClient, UpstreamResponse};
use crate::proxy::Error;
use crate::store::blob::{BlobStore, BlobWriter};
use crate::store::meta::MetaStore;
use crate::util::clock::{Clock, SystemClock};
use crate::util::httpdate::format_http_date;
use crate::util::lock_group::{BlockingOwned, LockGroup};
use crate::util::replace::ReplaceReader;
use crate::util::wait_group::WaitGroup;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use tokio::sync::OwnedRwLockWriteGuard;
use tracing::{debug, warn};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Everything a target needs to know before it is bound to a worker: origin
/// URLs, cache rules, body rewrites and transport settings.
pub struct TargetConfig {
    urls: Vec<String>,
    rules: Vec<Rule>,
    replaces: Vec<ReplaceRule>,
    transport: Transport,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl TargetConfig {
    pub fn new<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        TargetConfig {
            urls: urls
                .into_iter()
                .map(|url| url.as_ref().trim().trim_matches('/').to_owned())
                .collect(),
            rules: Vec::new(),
            replaces: Vec::new(),
            transport: Transport::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Appends a cache rule; rules are tried in the order they were added.
    pub fn add_rule(
        &mut self,
        regex: &str,
        cache: TimeDelta,
        refresh: TimeDelta,
    ) -> Result<(), RuleError> {
        self.rules.push(Rule::new(regex, cache, refresh)?);
        Ok(())
    }

    /// Appends a body rewrite applied to responses for matching paths.
    pub fn add_replace(&mut self, regex: &str, old: &str, new: &str) -> Result<(), RuleError> {
        self.replaces.push(ReplaceRule::new(regex, old, new)?);
        Ok(())
    }

    pub fn set_transport(&mut self, transport: Transport) {
        self.transport = transport;
    }

    #[cfg(test)]
    pub(crate) fn set_clock(&mut self, clock: Arc<dyn Clock + Send + Sync>) {
        self.clock = clock;
    }
}

/// A named routing entry: ordered upstream origins plus the cache and rewrite
/// rules for the paths below its prefix.
///
/// Immutable after [bind](Target::bind) except for its internal sync
/// structures.
pub struct Target {
    name: String,
    urls: Vec<String>,
    rules: Vec<Rule>,
    replaces: Vec<ReplaceRule>,
    locks: LockGroup,
    meta: Arc<MetaStore>,
    blobs: Arc<BlobStore>,
    client: UpstreamClient,
    inflight: WaitGroup,
    clock: Arc<dyn Clock + Send + Sync>,
}

/// A cache record read back from the meta store.
struct CachedEntry {
    hash: String,
    data: HashMap<String, String>,
    last_update: DateTime<Utc>,
}

impl Target {
    pub(crate) fn bind(
        name: &str,
        config: TargetConfig,
        meta: MetaStore,
        blobs: Arc<BlobStore>,
    ) -> Result<Self, Error> {
        let client = UpstreamClient::new(&config.transport)?;
        Ok(Target {
            name: name.to_owned(),
            urls: config.urls,
            rules: config.rules,
            replaces: config.replaces,
            locks: LockGroup::new(),
            meta: Arc::new(meta),
            blobs,
            client,
            inflight: WaitGroup::new(),
            clock: config.clock,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The pointer under which this target references a path's blob.
    fn pointer(&self, path: &str) -> String {
        format!("{}@{}", self.name, path)
    }

    /// Serves `path`, deciding between the local blob, a refresh from the
    /// origins, and a transparent pass-through.
    ///
    /// `request_headers` are forwarded to the origin; a `Range` header among
    /// them makes an uncached path bypass the cache entirely.
    pub fn forward(
        &self,
        path: &str,
        request_headers: &[(String, String)],
    ) -> Result<ResponseWrapper, Error> {
        let _inflight = self.inflight.enter();
        let mut response = self.fetch(path, request_headers)?;
        for replace in self.replaces.iter().filter(|r| r.matches(path)) {
            debug!(path = %path, "rewriting response body");
            // The rewrite changes the length and the body is no longer
            // seekable afterwards.
            response.headers.remove("Content-Length");
            let stream = std::mem::replace(&mut response.body, Body::Empty).into_stream();
            response.body = Body::Stream(Box::new(ReplaceReader::new(
                stream,
                replace.pattern(),
                replace.replacement(),
            )));
        }
        Ok(response)
    }

    fn fetch(
        &self,
        path: &str,
        request_headers: &[(String, String)],
    ) -> Result<ResponseWrapper, Error> {
        let Some(rule) = self.rules.iter().find(|rule| rule.matches(path)) else {
            // No rule, no caching: hand the origin response through as-is.
            let upstream = self.open_remote(path, true, request_headers)?;
            let mut response = passthrough(upstream, None);
            response.set_header("Cache-Control", "no-cache");
            response.set_header("X-Cache", CACHE_MISS);
            return Ok(response);
        };

        let lock = self.locks.get(path);
        {
            let guard = lock.clone().blocking_read_owned();
            if let Some(entry) = self.fresh_entry(path, rule)? {
                if let Some(response) = self.open_hit(&entry, PathGuard::Shared(guard))? {
                    return Ok(response);
                }
                // The meta record points at a blob that is gone; re-download.
            }
        }

        if find_header(request_headers, "Range").is_some() {
            // Partial content must never seed the cache. Serve the range
            // straight from the origin instead of downloading the full body
            // under the exclusive lock.
            let upstream = self.open_remote(path, true, request_headers)?;
            let mut response = passthrough(upstream, None);
            response.set_header("Cache-Control", "no-cache");
            response.set_header("X-Cache", CACHE_MISS);
            return Ok(response);
        }

        let guard = lock.clone().blocking_write_owned();
        if self.fresh_entry(path, rule)?.is_some() {
            // Someone else repopulated the cache while we queued for the
            // exclusive lock; downgrade and serve the fresh blob.
            drop(guard);
            let read_guard = lock.clone().blocking_read_owned();
            if let Some(entry) = self.fresh_entry(path, rule)? {
                if let Some(response) = self.open_hit(&entry, PathGuard::Shared(read_guard))? {
                    return Ok(response);
                }
            }
            let guard = lock.blocking_write_owned();
            return self.download(path, request_headers, guard);
        }
        self.download(path, request_headers, guard)
    }

    /// Fetches `path` from the origins and streams it to the client while
    /// writing the blob store copy. Runs under the exclusive per-path lock,
    /// which is released when the returned body is dropped.
    fn download(
        &self,
        path: &str,
        request_headers: &[(String, String)],
        guard: OwnedRwLockWriteGuard<()>,
    ) -> Result<ResponseWrapper, Error> {
        let upstream = match self.open_remote(path, false, request_headers) {
            Ok(upstream) => upstream,
            Err(err) => {
                debug!(path = %path, error = %err, "all origins failed, falling back to the stored copy");
                return self.open_stale(path, guard, err);
            }
        };

        let last_modified = upstream.headers.get("Last-Modified").cloned();
        let length = upstream.headers.get("Content-Length").cloned();
        let (Some(last_modified), Some(length)) = (last_modified, length) else {
            // Nothing to validate a cached copy against; stream it through
            // uncached.
            return Ok(passthrough(upstream, Some(PathGuard::Exclusive(guard))));
        };
        let content_type = upstream
            .headers
            .get("Content-Type")
            .cloned()
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_owned());

        let stored = self.cached_any(path)?;
        if let Some(entry) = &stored {
            if entry.data.get("last-modified") == Some(&last_modified) {
                match self.blobs.get(&entry.hash) {
                    Ok(reader) => {
                        // Origin content is unchanged; refresh the record's
                        // timestamp and serve the local copy.
                        debug!(path = %path, "origin unchanged, touching cache record");
                        drop(upstream);
                        self.meta.put(path, &[], false)?;
                        let entry = CachedEntry {
                            last_update: self.clock.now(),
                            hash: entry.hash.clone(),
                            data: entry.data.clone(),
                        };
                        return Ok(self.hit_response(
                            &entry,
                            reader,
                            PathGuard::Exclusive(guard),
                        ));
                    }
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
            // The stored blob is being replaced; its pointer goes away now,
            // the new one is inserted when the download commits.
            match self.blobs.del_pointer(&entry.hash, &self.pointer(path)) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(path = %path, error = %err, "failed to drop old blob pointer")
                }
            }
        }

        let writer = self.blobs.writer()?;
        let mut headers = BTreeMap::new();
        headers.insert("Last-Modified".to_owned(), last_modified.clone());
        headers.insert("X-Cache".to_owned(), CACHE_WAIT.to_owned());
        headers.insert("Content-Length".to_owned(), length.clone());
        headers.insert("Content-Type".to_owned(), content_type.clone());
        let body = TransparentBody {
            upstream: upstream.body,
            writer: Some(writer),
            blobs: self.blobs.clone(),
            meta: self.meta.clone(),
            path: path.to_owned(),
            pointer: self.pointer(path),
            record: vec![
                ("last-modified".to_owned(), last_modified),
                ("length".to_owned(), length),
                ("content-type".to_owned(), content_type),
            ],
            _path_guard: guard,
        };
        Ok(ResponseWrapper {
            status: 200,
            headers,
            body: Body::Stream(Box::new(body)),
        })
    }

    /// Tries each origin in order; the first accepted response wins.
    fn open_remote(
        &self,
        path: &str,
        error_accept: bool,
        request_headers: &[(String, String)],
    ) -> Result<UpstreamResponse, Error> {
        let mut last_err = None;
        for url in &self.urls {
            let full_url = format!("{}/{}", url, path);
            match self.client.open(&full_url, error_accept, request_headers) {
                Ok(response) => return Ok(response),
                Err(err) => {
                    debug!(url = %full_url, error = %err, "origin attempt failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or(Error::NoUpstream))
    }

    /// Reads the cache record for `path`, with no freshness judgement.
    fn cached_any(&self, path: &str) -> io::Result<Option<CachedEntry>> {
        let last_update = match self.meta.get_last_update(path) {
            Ok(last_update) => last_update,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        let data = match self.meta.get_meta(path) {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        let Some(hash) = data.get("blob").cloned() else {
            return Ok(None);
        };
        Ok(Some(CachedEntry {
            hash,
            data,
            last_update,
        }))
    }

    /// Reads the cache record for `path` if it is still fresh under `rule`.
    fn fresh_entry(&self, path: &str, rule: &Rule) -> io::Result<Option<CachedEntry>> {
        let Some(entry) = self.cached_any(path)? else {
            return Ok(None);
        };
        let now = self.clock.now();
        let within_cache = rule.cache().is_zero() || entry.last_update + rule.cache() > now;
        let within_refresh = rule.refresh().is_zero() || entry.last_update + rule.refresh() > now;
        if within_cache && within_refresh {
            Ok(Some(entry))
        } else {
            debug!(path = %path, "cache record is due for refresh");
            Ok(None)
        }
    }

    /// Opens the entry's blob and builds the HIT response; `Ok(None)` means
    /// the blob disappeared underneath the record.
    fn open_hit(
        &self,
        entry: &CachedEntry,
        guard: PathGuard,
    ) -> io::Result<Option<ResponseWrapper>> {
        match self.blobs.get(&entry.hash) {
            Ok(reader) => Ok(Some(self.hit_response(entry, reader, guard))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn hit_response(
        &self,
        entry: &CachedEntry,
        reader: crate::store::blob::BlobReader,
        guard: PathGuard,
    ) -> ResponseWrapper {
        let mut headers = BTreeMap::new();
        headers.insert("X-Cache".to_owned(), CACHE_HIT.to_owned());
        headers.insert(
            "X-Cache-Fetch".to_owned(),
            format_http_date(entry.last_update),
        );
        for (meta_key, header) in [
            ("last-modified", "Last-Modified"),
            ("length", "Content-Length"),
            ("content-type", "Content-Type"),
        ] {
            if let Some(value) = entry.data.get(meta_key) {
                headers.insert(header.to_owned(), value.clone());
            }
        }
        ResponseWrapper {
            status: 200,
            headers,
            body: Body::Seekable(BlobBody {
                reader,
                _path_guard: Some(guard),
            }),
        }
    }

    /// Serves the stored copy after every origin failed; surfaces the origin
    /// error if there is none.
    fn open_stale(
        &self,
        path: &str,
        guard: OwnedRwLockWriteGuard<()>,
        err: Error,
    ) -> Result<ResponseWrapper, Error> {
        match self.cached_any(path) {
            Ok(Some(entry)) => match self.open_hit(&entry, PathGuard::Exclusive(guard))? {
                Some(response) => Ok(response),
                None => Err(err),
            },
            Ok(None) => Err(err),
            Err(meta_err) => {
                debug!(path = %path, error = %meta_err, "stale lookup failed");
                Err(err)
            }
        }
    }

    /// Sweeps expired meta records and drops the blob pointers they held.
    pub fn gc(&self) -> io::Result<()> {
        debug!(name = %self.name, "running meta gc");
        let removed = self.meta.gc(|path| {
            self.rules
                .iter()
                .find(|rule| rule.matches(path))
                .and_then(|rule| {
                    if rule.cache().is_zero() {
                        // Eternal entries are never swept.
                        None
                    } else {
                        Some(rule.cache())
                    }
                })
        })?;
        for (path, data) in removed {
            debug!(name = %self.name, path = %path, "expired cache record removed");
            let Some(hash) = data.get("blob") else {
                continue;
            };
            match self.blobs.del_pointer(hash, &self.pointer(&path)) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    debug!(path = %path, "blob already gone")
                }
                Err(err) => warn!(path = %path, error = %err, "failed to drop blob pointer"),
            }
        }
        Ok(())
    }

    /// Blocks until every in-flight [forward](Target::forward) call returned.
    pub(crate) fn close(&self) {
        self.inflight.wait();
    }
}

fn passthrough(upstream: UpstreamResponse, guard: Option<PathGuard>) -> ResponseWrapper {
    let body: Box<dyn Read + Send> = match guard {
        Some(guard) => Box::new(GuardedStream {
            inner: upstream.body,
            _path_guard: guard,
        }),
        None => Box::new(upstream.body),
    };
    ResponseWrapper {
        status: upstream.status,
        headers: upstream.headers,
        body: Body::Stream(body),
    }
}

/// Streams the origin body to the client while writing the blob store copy at
/// the same pace.
///
/// On clean end-of-stream the blob is committed and the meta record written
/// durably; if the client disconnects or the origin errors out, dropping this
/// body discards the staged bytes, leaving neither blob pointer nor record
/// behind. The exclusive per-path guard is released on drop either way.
struct TransparentBody {
    upstream: reqwest::blocking::Response,
    writer: Option<BlobWriter>,
    blobs: Arc<BlobStore>,
    meta: Arc<MetaStore>,
    path: String,
    pointer: String,
    record: Vec<(String, String)>,
    _path_guard: OwnedRwLockWriteGuard<()>,
}

impl TransparentBody {
    fn finish(&mut self) {
        let Some(writer) = self.writer.take() else {
            return;
        };
        match writer.commit(&self.pointer) {
            Ok(hash) => {
                let mut patch: Vec<(&str, &str)> = vec![("blob", &hash)];
                for (key, value) in &self.record {
                    patch.push((key.as_str(), value.as_str()));
                }
                if let Err(err) = self.meta.put(&self.path, &patch, true) {
                    warn!(path = %self.path, error = %err, "failed to write cache record");
                    // Without a record nothing holds the pointer; release it
                    // so the sweep can reclaim the blob.
                    if let Err(err) = self.blobs.del_pointer(&hash, &self.pointer) {
                        debug!(path = %self.path, error = %err, "pointer cleanup failed");
                    }
                    return;
                }
                debug!(path = %self.path, hash = %hash, "download cached");
            }
            Err(err) => warn!(path = %self.path, error = %err, "failed to commit blob"),
        }
    }
}

impl Read for TransparentBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.upstream.read(buf)?;
        if n == 0 {
            self.finish();
            return Ok(0);
        }
        if let Some(writer) = self.writer.as_mut() {
            if let Err(err) = writer.write_all(&buf[..n]) {
                // Keep serving the client; only the cache write is lost.
                warn!(path = %self.path, error = %err, "abandoning cache write");
                self.writer = None;
            }
        }
        Ok(n)
    }
}
