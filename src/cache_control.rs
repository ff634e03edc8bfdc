use hyper::HeaderMap;
use hyper::header::{CACHE_CONTROL, PRAGMA};

/// Response cache directives, parsed once per response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheDirectives {
    pub no_store: bool,
    pub no_cache: bool,
    pub private: bool,
    pub must_revalidate: bool,
    pub max_age: Option<u64>,
}

impl CacheDirectives {
    /// Parse every `Cache-Control` header in `headers`. `Pragma: no-cache` is
    /// honoured only when no `Cache-Control` header is present.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut directives = CacheDirectives::default();
        let mut saw_cache_control = false;

        for value in headers.get_all(CACHE_CONTROL) {
            saw_cache_control = true;
            if let Ok(value) = value.to_str() {
                directives.merge_str(value);
            }
        }

        if !saw_cache_control {
            let pragma_no_cache = headers.get_all(PRAGMA).iter().any(|value| {
                value
                    .to_str()
                    .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("no-cache")))
                    .unwrap_or(false)
            });
            directives.no_cache = pragma_no_cache;
        }

        directives
    }

    pub fn parse(value: &str) -> Self {
        let mut directives = CacheDirectives::default();
        directives.merge_str(value);
        directives
    }

    fn merge_str(&mut self, value: &str) {
        for token in value.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let (name, argument) = match token.split_once('=') {
                Some((name, argument)) => (name.trim(), Some(argument.trim().trim_matches('"'))),
                None => (token, None),
            };

            match name.to_ascii_lowercase().as_str() {
                "no-store" => self.no_store = true,
                "no-cache" => self.no_cache = true,
                "private" => self.private = true,
                "must-revalidate" => self.must_revalidate = true,
                "max-age" => {
                    if let Some(seconds) = argument.and_then(|a| a.parse::<u64>().ok()) {
                        // Conflicting max-age values: the most restrictive wins.
                        self.max_age = Some(self.max_age.map_or(seconds, |current| current.min(seconds)));
                    }
                }
                _ => {}
            }
        }
    }

    /// A response may be stored unless it is `no-store` or `private`.
    pub fn is_storable(&self) -> bool {
        !self.no_store && !self.private
    }

    /// `no-cache` and `must-revalidate` force a conditional request on every hit.
    pub fn requires_revalidation(&self) -> bool {
        self.no_cache || self.must_revalidate
    }
}
