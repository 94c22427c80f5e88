//! Per-request caching strategies
//!
//! Every strategy resolves to a `Response`; network and storage failures fall
//! back to cached content, an offline page, a placeholder image or a 408.

use super::cache_storage::CacheStorage;
use super::network::Network;
use super::request::{Request, Response};
use super::WorkerConfig;
use regex_lite::Regex;
use reqwest::Method;
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    /// Forwarded straight to the network
    Bypass,
    /// Network-first
    Api,
    /// Cache-first with background revalidation
    Navigation,
    /// Cache-first
    Static,
}

/// Compiled host patterns
#[derive(Debug, Clone, Default)]
pub struct HostRules {
    /// Network-first API hosts
    pub api: Vec<Regex>,
    /// Hosts that are never intercepted
    pub excluded: Vec<Regex>,
}

pub fn classify(request: &Request, config: &WorkerConfig, hosts: &HostRules) -> RequestClass {
    if request.method != Method::GET {
        return RequestClass::Bypass;
    }

    if !matches!(request.url.scheme(), "http" | "https") {
        return RequestClass::Bypass;
    }

    let path = request.url.path();
    if config.excluded_paths.iter().any(|prefix| path.starts_with(prefix.as_str())) {
        return RequestClass::Bypass;
    }

    let host = request.url.host_str().unwrap_or("");
    if hosts.excluded.iter().any(|re| re.is_match(host)) {
        return RequestClass::Bypass;
    }

    if path.starts_with("/api/") || hosts.api.iter().any(|re| re.is_match(host)) {
        return RequestClass::Api;
    }

    if request.is_navigation() {
        return RequestClass::Navigation;
    }

    RequestClass::Static
}

/// 408 used when nothing better is available
pub fn offline_timeout() -> Response {
    Response::json(
        408,
        &json!({
            "error": "offline",
            "message": "The network is unavailable and no cached response exists",
        }),
    )
}

/// Grey SVG standing in for an image that could not be loaded
pub fn placeholder_image() -> Response {
    let svg = concat!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="200" height="150" viewBox="0 0 200 150">"#,
        r##"<rect width="200" height="150" fill="#e5e7eb"/>"##,
        r##"<text x="100" y="80" font-family="sans-serif" font-size="14" fill="#6b7280" text-anchor="middle">Offline</text>"##,
        "</svg>"
    );
    Response::new(200, "image/svg+xml", svg)
}

/// Minimal offline page used when the cached one is missing too
pub fn fallback_offline_page() -> Response {
    Response::html(
        503,
        "<!doctype html><html><head><title>Offline</title></head>\
         <body><h1>You are offline</h1>\
         <p>Saved bookmarks and notes are still available. Reconnect to sync.</p></body></html>",
    )
}

async fn cached(caches: &dyn CacheStorage, cache_name: &str, request: &Request) -> Option<Response> {
    match caches.match_request(cache_name, request).await {
        Ok(found) => found,
        Err(e) => {
            log::warn!("Cache lookup failed for {}: {}", request.url, e);
            None
        }
    }
}

async fn cached_anywhere(caches: &dyn CacheStorage, request: &Request) -> Option<Response> {
    match caches.match_any(request).await {
        Ok(found) => found,
        Err(e) => {
            log::warn!("Cache lookup failed for {}: {}", request.url, e);
            None
        }
    }
}

async fn store(caches: &dyn CacheStorage, cache_name: &str, request: &Request, response: &Response) {
    if !response.is_success() {
        return;
    }
    if let Err(e) = caches.put(cache_name, request, response).await {
        log::warn!("Failed to cache {} in {}: {}", request.url, cache_name, e);
    }
}

/// Plain network with a 408 on failure
pub async fn network_only(network: &dyn Network, request: &Request) -> Response {
    match network.fetch(request).await {
        Ok(response) => response,
        Err(e) => {
            log::debug!("Network request failed for {}: {}", request.url, e);
            offline_timeout()
        }
    }
}

/// API requests: fresh data when possible, last cached copy otherwise
pub async fn network_first(
    network: &dyn Network,
    caches: &dyn CacheStorage,
    cache_name: &str,
    request: &Request,
) -> Response {
    match network.fetch(request).await {
        Ok(response) => {
            store(caches, cache_name, request, &response).await;
            response
        }
        Err(e) => {
            log::debug!("API request failed for {}, trying cache: {}", request.url, e);
            match cached(caches, cache_name, request).await {
                Some(response) => response,
                None => offline_timeout(),
            }
        }
    }
}

/// HTML navigations: serve cached HTML immediately and refresh it in the background
pub async fn stale_while_revalidate(
    network: Arc<dyn Network>,
    caches: Arc<dyn CacheStorage>,
    cache_name: &str,
    offline_page: &Request,
    request: &Request,
) -> Response {
    if let Some(response) = cached_anywhere(caches.as_ref(), request).await {
        let (network, caches) = (network.clone(), caches.clone());
        let (cache_name, request) = (cache_name.to_string(), request.clone());

        tokio::spawn(async move {
            match network.fetch(&request).await {
                Ok(fresh) => store(caches.as_ref(), &cache_name, &request, &fresh).await,
                Err(e) => log::debug!("Background revalidation failed for {}: {}", request.url, e),
            }
        });

        return response;
    }

    match network.fetch(request).await {
        Ok(response) => {
            store(caches.as_ref(), cache_name, request, &response).await;
            response
        }
        Err(e) => {
            log::info!("Navigation to {} failed offline, serving offline page: {}", request.url, e);
            match cached_anywhere(caches.as_ref(), offline_page).await {
                Some(page) => page,
                None => fallback_offline_page(),
            }
        }
    }
}

/// Static assets: cache, then network, then a placeholder or 408
pub async fn cache_first(
    network: &dyn Network,
    caches: &dyn CacheStorage,
    cache_name: &str,
    request: &Request,
) -> Response {
    if let Some(response) = cached_anywhere(caches, request).await {
        return response;
    }

    match network.fetch(request).await {
        Ok(response) => {
            store(caches, cache_name, request, &response).await;
            response
        }
        Err(e) => {
            log::debug!("Asset request failed for {}: {}", request.url, e);
            if request.is_image() {
                placeholder_image()
            } else {
                offline_timeout()
            }
        }
    }
}
