//! Route templates and their compiled, parameter-bound form.
//!
//! A [`Route`] is a static template such as `POST /channels/{channel}/messages`. Compiling it
//! with concrete values yields a [`CompiledRoute`], which knows its *major parameter* (the first
//! placeholder). The server groups routes into buckets, and the major parameter further splits a
//! bucket into independent windows, so the manager keys buckets by
//! `"{server_hash};{major_param}"`.
//!
//! ```rust
//! use bucketeer::{Method, Route};
//!
//! const POST_MESSAGES: Route = Route::new(Method::Post, "/channels/{channel}/messages");
//!
//! let compiled = POST_MESSAGES.compile([("channel", 42)]).unwrap();
//! assert_eq!(compiled.compiled_path(), "/channels/42/messages");
//! assert_eq!(compiled.create_real_bucket_hash("abc"), "abc;42");
//! ```

use crate::RateLimitError;
use std::collections::HashMap;
use std::fmt;

/// Separator between the server bucket hash and the major parameter value.
pub const HASH_SEPARATOR: &str = ";";

/// Major parameter value used for routes without any placeholder.
pub const NO_MAJOR_PARAM: &str = "-";

/// HTTP verb of a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    /// Upper-case verb as sent on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment<'a> {
    Literal(&'a str),
    Param(&'a str),
}

fn parse_template(template: &str) -> Result<Vec<Segment<'_>>, RateLimitError> {
    let malformed =
        |reason| RateLimitError::MalformedTemplate { template: template.to_string(), reason };

    let mut segments = Vec::new();
    let mut rest = template;
    while !rest.is_empty() {
        match rest.find(|c: char| c == '{' || c == '}') {
            None => {
                segments.push(Segment::Literal(rest));
                break;
            }
            Some(idx) if rest.as_bytes()[idx] == b'}' => {
                return Err(malformed("unmatched '}'"));
            }
            Some(idx) => {
                if idx > 0 {
                    segments.push(Segment::Literal(&rest[..idx]));
                }
                let after = &rest[idx + 1..];
                let close = after.find('}').ok_or_else(|| malformed("unclosed '{'"))?;
                let name = &after[..close];
                if name.is_empty() {
                    return Err(malformed("empty placeholder"));
                }
                if name.contains('{') {
                    return Err(malformed("nested '{'"));
                }
                segments.push(Segment::Param(name));
                rest = &after[close + 1..];
            }
        }
    }
    Ok(segments)
}

/// A route template. Cheap to copy; usually declared as a `const`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Route {
    method: Method,
    path_template: &'static str,
}

impl Route {
    /// Declare a route. The template is validated when it is compiled.
    pub const fn new(method: Method, path_template: &'static str) -> Self {
        Self { method, path_template }
    }

    /// The HTTP method.
    pub fn method(&self) -> Method {
        self.method
    }

    /// The template string used for the path.
    pub fn path_template(&self) -> &'static str {
        self.path_template
    }

    /// Name of the first placeholder, if the template has one and is well formed.
    pub fn major_param(&self) -> Option<&'static str> {
        parse_template(self.path_template).ok()?.into_iter().find_map(|s| match s {
            Segment::Param(name) => Some(name),
            Segment::Literal(_) => None,
        })
    }

    /// Check that the template parses.
    pub fn validate(&self) -> Result<(), RateLimitError> {
        parse_template(self.path_template).map(|_| ())
    }

    /// Substitute `params` into the template.
    ///
    /// Names that do not appear in the template are ignored. Every placeholder must have a value.
    pub fn compile<I, K, V>(&self, params: I) -> Result<CompiledRoute, RateLimitError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: fmt::Display,
    {
        let values: HashMap<String, String> =
            params.into_iter().map(|(k, v)| (k.as_ref().to_string(), v.to_string())).collect();

        let segments = parse_template(self.path_template)?;
        let mut compiled_path = String::with_capacity(self.path_template.len());
        let mut major_param_hash = None;

        for segment in segments {
            match segment {
                Segment::Literal(text) => compiled_path.push_str(text),
                Segment::Param(name) => {
                    let value = values.get(name).ok_or_else(|| RateLimitError::MissingParameter {
                        route: self.path_template.to_string(),
                        param: name.to_string(),
                    })?;
                    compiled_path.push_str(value);
                    if major_param_hash.is_none() {
                        major_param_hash = Some(value.clone());
                    }
                }
            }
        }

        Ok(CompiledRoute {
            route: *self,
            compiled_path,
            major_param_hash: major_param_hash.unwrap_or_else(|| NO_MAJOR_PARAM.to_string()),
        })
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path_template)
    }
}

/// A route bound to concrete parameter values for one request attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompiledRoute {
    route: Route,
    compiled_path: String,
    major_param_hash: String,
}

impl CompiledRoute {
    /// The template this was compiled from.
    pub fn route(&self) -> &Route {
        &self.route
    }

    /// The HTTP method.
    pub fn method(&self) -> Method {
        self.route.method
    }

    /// Path with every placeholder substituted.
    pub fn compiled_path(&self) -> &str {
        &self.compiled_path
    }

    /// Value of the major parameter, or `"-"` when the route has none.
    pub fn major_param_hash(&self) -> &str {
        &self.major_param_hash
    }

    /// Combine a server bucket hash with this route's major parameter.
    pub fn create_real_bucket_hash(&self, bucket_hash: &str) -> String {
        let mut real = String::with_capacity(
            bucket_hash.len() + HASH_SEPARATOR.len() + self.major_param_hash.len(),
        );
        real.push_str(bucket_hash);
        real.push_str(HASH_SEPARATOR);
        real.push_str(&self.major_param_hash);
        real
    }

    /// Full URL for the request.
    pub fn create_url(&self, base_url: &str) -> String {
        format!("{}{}", base_url, self.compiled_path)
    }
}

impl fmt::Display for CompiledRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.route.method, self.compiled_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GET_MESSAGE: Route = Route::new(Method::Get, "/channels/{channel}/messages/{message}");
    const GET_GATEWAY: Route = Route::new(Method::Get, "/gateway/bot");

    #[test]
    fn major_param_is_first_placeholder() {
        assert_eq!(GET_MESSAGE.major_param(), Some("channel"));
        assert_eq!(GET_GATEWAY.major_param(), None);
    }

    #[test]
    fn compile_substitutes_all_placeholders() {
        let compiled =
            GET_MESSAGE.compile([("message", "789"), ("channel", "123")]).expect("compiles");
        assert_eq!(compiled.compiled_path(), "/channels/123/messages/789");
        assert_eq!(compiled.major_param_hash(), "123");
        assert_eq!(compiled.method(), Method::Get);
        assert_eq!(compiled.to_string(), "GET /channels/123/messages/789");
    }

    #[test]
    fn compile_ignores_unknown_params() {
        let compiled = GET_GATEWAY.compile([("unused", 1)]).expect("compiles");
        assert_eq!(compiled.compiled_path(), "/gateway/bot");
        assert_eq!(compiled.major_param_hash(), NO_MAJOR_PARAM);
    }

    #[test]
    fn compile_without_required_param_fails() {
        let err = GET_MESSAGE.compile([("channel", "1")]).unwrap_err();
        assert_eq!(
            err,
            RateLimitError::MissingParameter {
                route: "/channels/{channel}/messages/{message}".into(),
                param: "message".into(),
            }
        );
    }

    #[test]
    fn malformed_templates_are_rejected() {
        for template in ["/channels/{channel", "/channels/}", "/channels/{}", "/a/{b{c}"] {
            let route = Route::new(Method::Get, template);
            let err = route.compile(Vec::<(&str, &str)>::new()).unwrap_err();
            assert!(
                matches!(err, RateLimitError::MalformedTemplate { .. }),
                "{template} should be malformed, got {err:?}"
            );
            assert!(route.validate().is_err());
            assert_eq!(route.major_param(), None);
        }
    }

    #[test]
    fn real_bucket_hash_combines_header_and_major_param() {
        let route = Route::new(Method::Post, "/channels/{channel}/messages");
        let a = route.compile([("channel", 42)]).unwrap();
        let b = route.compile([("channel", 43)]).unwrap();
        assert_eq!(a.create_real_bucket_hash("abc"), "abc;42");
        assert_eq!(a.create_real_bucket_hash("abc"), a.create_real_bucket_hash("abc"));
        assert_ne!(a.create_real_bucket_hash("abc"), b.create_real_bucket_hash("abc"));
        assert_eq!(GET_GATEWAY.compile([("x", 0)]).unwrap().create_real_bucket_hash("UNKNOWN"), "UNKNOWN;-");
    }

    #[test]
    fn create_url_prefixes_base() {
        let compiled = GET_GATEWAY.compile([("x", 0)]).unwrap();
        assert_eq!(compiled.create_url("https://example.test/api/v10"), "https://example.test/api/v10/gateway/bot");
    }

    #[test]
    fn routes_hash_by_method_and_template() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(GET_MESSAGE);
        set.insert(Route::new(Method::Get, "/channels/{channel}/messages/{message}"));
        set.insert(Route::new(Method::Patch, "/channels/{channel}/messages/{message}"));
        assert_eq!(set.len(), 2);
    }
}
