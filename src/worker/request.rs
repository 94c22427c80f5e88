//! Intercepted request and synthesized response types

use reqwest::Method;
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
    Navigate,
    #[default]
    Cors,
    NoCors,
    SameOrigin,
}

/// What the page intends to do with the response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestDestination {
    Document,
    Image,
    Script,
    Style,
    Font,
    #[default]
    Empty,
    Other,
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub mode: RequestMode,
    pub destination: RequestDestination,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            mode: RequestMode::default(),
            destination: RequestDestination::default(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: &str) -> Result<Self, url::ParseError> {
        Ok(Self::new(Method::GET, Url::parse(url)?))
    }

    /// Top-level HTML navigation
    pub fn navigate(url: &str) -> Result<Self, url::ParseError> {
        let mut request = Self::get(url)?;
        request.mode = RequestMode::Navigate;
        request.destination = RequestDestination::Document;
        request
            .headers
            .push(("accept".to_string(), mime::TEXT_HTML.to_string()));
        Ok(request)
    }

    pub fn with_destination(mut self, destination: RequestDestination) -> Self {
        self.destination = destination;
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_ascii_lowercase(), value.to_string()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
            || self
                .header("accept")
                .map_or(false, |accept| accept.contains(mime::TEXT_HTML.essence_str()))
    }

    pub fn is_image(&self) -> bool {
        if self.destination == RequestDestination::Image {
            return true;
        }
        let path = self.url.path().to_ascii_lowercase();
        [".png", ".jpg", ".jpeg", ".gif", ".webp", ".svg", ".ico"]
            .iter()
            .any(|ext| path.ends_with(ext))
    }

    /// Identity used by named caches; the fragment never reaches the server
    pub fn cache_key(&self) -> String {
        let mut url = self.url.clone();
        url.set_fragment(None);
        format!("{} {}", self.method, url)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: vec![("content-type".to_string(), content_type.to_string())],
            body: body.into(),
        }
    }

    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self::new(status, mime::APPLICATION_JSON.as_ref(), value.to_string())
    }

    pub fn html(status: u16, body: &str) -> Self {
        Self::new(status, mime::TEXT_HTML_UTF_8.as_ref(), body)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_navigation_detection() {
        let nav = Request::navigate("https://app.tabkeep.dev/").unwrap();
        assert!(nav.is_navigation());

        let html_accept = Request::get("https://app.tabkeep.dev/notes")
            .unwrap()
            .with_header("Accept", "text/html,application/xhtml+xml");
        assert!(html_accept.is_navigation());

        let script = Request::get("https://app.tabkeep.dev/app.js").unwrap();
        assert!(!script.is_navigation());
    }

    #[test]
    fn test_image_detection() {
        assert!(Request::get("https://cdn.example.com/logo.PNG").unwrap().is_image());
        assert!(Request::get("https://cdn.example.com/avatar")
            .unwrap()
            .with_destination(RequestDestination::Image)
            .is_image());
        assert!(!Request::get("https://cdn.example.com/app.css").unwrap().is_image());
    }

    #[test]
    fn test_cache_key_ignores_fragment() {
        let a = Request::get("https://app.tabkeep.dev/page?x=1#top").unwrap();
        let b = Request::get("https://app.tabkeep.dev/page?x=1").unwrap();
        assert_eq!(a.cache_key(), b.cache_key());
        assert!(a.cache_key().starts_with("GET "));
    }

    #[test]
    fn test_json_response() {
        let response = Response::json(408, &serde_json::json!({"error": "offline"}));
        assert!(!response.is_success());
        assert_eq!(response.content_type(), Some("application/json"));
        assert!(response.text().contains("offline"));
    }
}
