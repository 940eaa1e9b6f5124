//! Cache operations of the remote service.

use std::collections::BTreeMap;

use fpc_backlog::HealthStatus;
use fpc_transport::{Request, Response, ResponseStatus};

use super::ApiClient;
use crate::ApiError;
use crate::batch::BatchPool;

const URL_HEADER: &str = "X-Nitro-Url";

/// Visitor details forwarded with a remote cache lookup.
#[derive(Debug, Clone, Default)]
pub struct LookupContext {
    pub user_agent: String,
    pub cookies: BTreeMap<String, String>,
    pub ajax: bool,
    /// Remote layout name, `default` when empty.
    pub layout: String,
    pub remote_addr: String,
    pub referer: Option<String>,
    pub cache_prefix: Option<String>,
}

impl LookupContext {
    fn layout(&self) -> &str {
        if self.layout.is_empty() {
            "default"
        } else {
            &self.layout
        }
    }
}

/// Flags sent with a purge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeOptions {
    /// Keep optimized assets, drop only rendered pages.
    pub pagecache_only: bool,
    pub reason: Option<String>,
    /// Let the service keep serving the old pages until new ones are ready.
    pub light: bool,
}

impl ApiClient {
    /// Ask the service for its rendering of `url`.
    ///
    /// The response is returned whatever its status; only a `200` carries a
    /// page.
    pub fn get(&self, url: &str, context: &LookupContext) -> Result<Response, ApiError> {
        let request = self.lookup_request(context).header(URL_HEADER, url);
        self.send(request, false)
    }

    /// Look up many URLs at once, five at a time.
    ///
    /// Lookups whose response did not arrive in time are left out. Any other
    /// failure or a non-OK response fails the whole call.
    pub fn get_multi(
        &self,
        urls: &[String],
        context: &LookupContext,
    ) -> Result<BTreeMap<String, Response>, ApiError> {
        let template = self.lookup_request(context);
        let mut admitted = Vec::with_capacity(urls.len());
        for url in urls {
            let request = template.clone().header(URL_HEADER, url.as_str());
            match self.admit(request, false) {
                Ok(request) => admitted.push(request),
                Err(e) if e.is_service_down() => {}
                Err(e) => return Err(e),
            }
        }

        let outcomes = BatchPool::for_lookups(admitted.len()).run(&self.transport(), admitted)?;
        let mut pages = BTreeMap::new();
        for outcome in outcomes {
            let response = match outcome.result {
                Ok(response) => response,
                Err(e) if e.is_read_timeout() => continue,
                Err(e) => return Err(e.into()),
            };
            if response.status() != ResponseStatus::Ok {
                return Err(ApiError::from_response(&response, "Error while getting cache"));
            }
            let Some(url) = outcome.request.headers.get(URL_HEADER) else {
                return Err(ApiError::from_response(
                    &response,
                    "Error while getting cache, url header missing",
                ));
            };
            pages.insert(url.clone(), response);
        }
        Ok(pages)
    }

    /// Details of the most recent purge, as the service reports them.
    pub fn get_last_purge(&self) -> Result<serde_json::Value, ApiError> {
        let path = format!("cache/getlastpurge/{}", self.site_id());
        let response = self.send(Request::get(path), false)?;
        if response.status() != ResponseStatus::Ok {
            return Err(ApiError::from_response(
                &response,
                "Error while getting information about the last cache purge",
            ));
        }
        Ok(response.json()?)
    }

    /// Purge one URL, or the whole site when `url` is `None`.
    ///
    /// A response that does not arrive in time counts as success.
    pub fn purge(&self, url: Option<&str>, options: &PurgeOptions) -> Result<(), ApiError> {
        let mut request = self.purge_request(options);
        if let Some(url) = url {
            request = request.field("url", url);
        }
        if options.pagecache_only {
            request = request.field("pagecache_only", "1");
        }

        let response = match self.send(request, true) {
            Ok(response) => response,
            Err(ApiError::Transport(e)) if e.is_read_timeout() => {
                tracing::debug!(url, "Purge response timed out");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if response.status() != ResponseStatus::Ok {
            return Err(ApiError::from_response(&response, "Error while purging cache"));
        }
        Ok(())
    }

    /// Purge many URLs concurrently.
    ///
    /// Purges that end in a server error, a read timeout or exhausted retries
    /// are queued in the backlog. Read timeouts otherwise count as success.
    pub fn purge_urls(&self, urls: &[String], options: &PurgeOptions) -> Result<(), ApiError> {
        if urls.is_empty() {
            return Ok(());
        }

        let mut admitted = Vec::with_capacity(urls.len());
        let mut refused = None;
        for url in urls {
            let request = self.purge_request(options).field("url", url.as_str());
            match self.admit(request, self.backlog().is_enabled()) {
                Ok(request) => admitted.push(request),
                Err(e) if e.is_service_down() => refused = Some(e),
                Err(e) => return Err(e),
            }
        }
        if admitted.is_empty()
            && let Some(e) = refused
        {
            return Err(e);
        }

        let outcomes = BatchPool::for_purges(admitted.len()).run(&self.transport(), admitted)?;
        let mut failure = None;
        let mut rejection = None;
        for outcome in outcomes {
            match &outcome.result {
                Ok(response) if response.code >= 500 => {
                    self.backlog().append(&outcome.request)?;
                    self.health().record_server_errors()?;
                }
                Ok(_) => {}
                Err(e) if e.is_read_timeout() => {
                    self.backlog().append(&outcome.request)?;
                    self.health().set(HealthStatus::Sick)?;
                    continue;
                }
                Err(e) => {
                    if e.is_retryable() {
                        self.backlog().append(&outcome.request)?;
                    }
                    tracing::warn!(path = %outcome.request.path, error = %e, retries = outcome.retries, "Purge failed");
                }
            }
            match outcome.result {
                Ok(response) if response.status() != ResponseStatus::Ok => {
                    rejection.get_or_insert(response);
                }
                Ok(_) => {}
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }

        if let Some(e) = failure {
            return Err(e.into());
        }
        if let Some(response) = rejection {
            return Err(ApiError::from_response(&response, "Error while purging cache"));
        }
        tracing::info!(count = urls.len(), "Purged URLs remotely");
        Ok(())
    }

    /// Purge every URL tagged `tag`. Returns the URLs the service purged.
    pub fn purge_by_tag(&self, tag: &str, options: &PurgeOptions) -> Result<Vec<String>, ApiError> {
        #[derive(serde::Deserialize)]
        struct TagPurge {
            #[serde(default)]
            purged_urls: Vec<String>,
        }

        let request = self.purge_request(options).field("tag", tag);
        let response = self.send(request, true)?;
        if response.status() != ResponseStatus::Ok {
            return Err(ApiError::from_response(&response, "Error while purging cache by tag"));
        }
        let purged: TagPurge = response.json()?;
        Ok(purged.purged_urls)
    }

    fn lookup_request(&self, context: &LookupContext) -> Request {
        let path = format!("cache/get/{}/{}", self.site_id(), context.layout());
        let mut request = Request::get(path)
            .header("X-Nitro-Visitor-Addr", context.remote_addr.as_str())
            .header("User-Agent", context.user_agent.as_str())
            .cookies(&context.cookies);
        if let Some(prefix) = context.cache_prefix.as_deref().filter(|p| !p.is_empty()) {
            request = request.header("X-Nitro-Cache-Prefix", prefix);
        }
        if context.ajax {
            request = request.header("X-Nitro-Ajax", "1");
        }
        if let Some(referer) = &context.referer {
            request = request.header("Referer", referer.as_str());
        }
        request
    }

    fn purge_request(&self, options: &PurgeOptions) -> Request {
        let mut request = Request::post(format!("cache/purge/{}", self.site_id()));
        if let Some(reason) = options.reason.as_deref().filter(|r| !r.is_empty()) {
            request = request.field("reason", reason);
        }
        if options.light {
            request = request.field("light_purge", "1");
        }
        request
    }
}
