//! Segment tree router.
//!
//! Routes are split by `/` into segments, each of which is one of:
//!
//! - a literal, matched exactly: `/users`
//! - a named parameter, capturing one non-empty segment: `/users/:id`
//! - a wildcard, capturing the rest of the path: `/files/*path`
//!
//! Every method has its own tree. At each node the lookup tries the literal
//! child first, then the parameter child, then the wildcard child, and
//! backtracks when a branch has no route below it. A literal route therefore
//! always wins over a parameter registered at the same position.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Write};
use std::sync::Arc;

use crate::config::Config;
use crate::error::RouteError;
use crate::handler::Handler;

/// The path parameters captured by a route lookup.
///
/// The storage keeps its capacity across requests; see [`Params::clear`].
#[derive(Debug, Clone, Default)]
pub struct Params {
    names: Vec<Arc<str>>,
    values: Vec<String>,
}

impl Params {
    pub fn with_capacity(capacity: usize) -> Self {
        Params {
            names: Vec::with_capacity(capacity),
            values: Vec::with_capacity(capacity),
        }
    }

    /// Returns the value captured for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.names
            .iter()
            .position(|n| &**n == name)
            .and_then(|i| self.values.get(i))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.values.capacity().min(self.names.capacity())
    }

    /// Iterates over `(name, value)` pairs in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.names
            .iter()
            .zip(self.values.iter())
            .map(|(n, v)| (&**n, v.as_str()))
    }

    /// Forgets the captured values but keeps the allocated slots.
    pub fn clear(&mut self) {
        self.names.clear();
        self.values.clear();
    }

    /// Grows the slots so that `total` parameters fit without reallocation.
    pub(crate) fn reserve(&mut self, total: usize) {
        self.names.reserve(total.saturating_sub(self.names.len()));
        self.values.reserve(total.saturating_sub(self.values.len()));
    }
}

/// A registered route, as reported by [`Router::each`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteInfo {
    pub name: String,
    pub method: String,
    pub path: String,
}

#[derive(Clone)]
struct Endpoint {
    handler: Handler,
    names: Arc<[Arc<str>]>,
}

#[derive(Clone)]
struct Child {
    name: String,
    node: Node,
}

#[derive(Clone, Default)]
struct Node {
    literals: HashMap<String, Node>,
    param: Option<Box<Child>>,
    wildcard: Option<Box<Child>>,
    endpoint: Option<Endpoint>,
}

impl Node {
    fn lookup<'a>(&'a self, rest: Option<&str>, values: &mut Vec<String>) -> Option<&'a Endpoint> {
        let path = match rest {
            Some(path) => path,
            None => return self.endpoint.as_ref(),
        };

        let (segment, remainder) = match path.find('/') {
            Some(i) => (&path[..i], Some(&path[i + 1..])),
            None => (path, None),
        };

        if let Some(child) = self.literals.get(segment) {
            if let Some(endpoint) = child.lookup(remainder, values) {
                return Some(endpoint);
            }
        }

        if let Some(param) = &self.param {
            if !segment.is_empty() {
                values.push(segment.to_owned());
                if let Some(endpoint) = param.node.lookup(remainder, values) {
                    return Some(endpoint);
                }
                values.pop();
            }
        }

        if let Some(wildcard) = &self.wildcard {
            if let Some(endpoint) = wildcard.node.endpoint.as_ref() {
                values.push(path.to_owned());
                return Some(endpoint);
            }
        }

        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment<'a> {
    Literal(&'a str),
    Param(&'a str),
    Wildcard(&'a str),
}

fn invalid(path: &str, reason: &'static str) -> RouteError {
    RouteError::InvalidPath {
        path: path.to_owned(),
        reason,
    }
}

fn parse(path: &str) -> Result<Vec<Segment<'_>>, RouteError> {
    let rest = path
        .strip_prefix('/')
        .ok_or_else(|| invalid(path, "the path must start with '/'"))?;
    if rest.is_empty() {
        return Ok(Vec::new());
    }

    let parts: Vec<&str> = rest.split('/').collect();
    let last = parts.len() - 1;
    let mut segments = Vec::with_capacity(parts.len());
    for (i, part) in parts.into_iter().enumerate() {
        let segment = if let Some(name) = part.strip_prefix(':') {
            if name.is_empty() {
                return Err(invalid(path, "empty parameter name"));
            }
            Segment::Param(name)
        } else if let Some(name) = part.strip_prefix('*') {
            if i != last {
                return Err(invalid(path, "the wildcard must be the last segment"));
            }
            Segment::Wildcard(if name.is_empty() { "*" } else { name })
        } else {
            // A trailing empty segment is the kept trailing slash.
            if part.is_empty() && i != last {
                return Err(invalid(path, "empty segment"));
            }
            Segment::Literal(part)
        };
        segments.push(segment);
    }
    Ok(segments)
}

fn strip_trailing_slash(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() && path.starts_with('/') {
        "/"
    } else {
        trimmed
    }
}

/// Resolves `(method, path)` pairs to handlers.
///
/// The tree is built during registration and only read afterwards, so a
/// shared router needs no locking for lookups.
#[derive(Clone)]
pub struct Router {
    trees: BTreeMap<String, Node>,
    routes: Vec<RouteInfo>,
    names: HashMap<String, String>,
    max_params: usize,
    keep_trailing_slash: bool,
}

impl Router {
    /// Creates an empty router honouring the parameter limit and the
    /// trailing-slash policy of `config`.
    pub fn new(config: &Config) -> Self {
        Router {
            trees: BTreeMap::new(),
            routes: Vec::new(),
            names: HashMap::new(),
            max_params: config.max_params,
            keep_trailing_slash: config.keep_trailing_slash,
        }
    }

    fn normalize<'p>(&self, path: &'p str) -> &'p str {
        if self.keep_trailing_slash {
            path
        } else {
            strip_trailing_slash(path)
        }
    }

    /// Registers `handler` for `method` and `path`, returning the number of
    /// parameters of the route.
    ///
    /// An empty `name` leaves the route unnamed.
    pub fn add(
        &mut self,
        name: &str,
        method: &str,
        path: &str,
        handler: Handler,
    ) -> Result<usize, RouteError> {
        let path = self.normalize(path).to_owned();
        let segments = parse(&path)?;

        let names: Vec<Arc<str>> = segments
            .iter()
            .filter_map(|segment| match segment {
                Segment::Param(name) | Segment::Wildcard(name) => Some(Arc::from(*name)),
                Segment::Literal(_) => None,
            })
            .collect();
        if names.len() > self.max_params {
            return Err(RouteError::TooManyParams {
                path: path.clone(),
                count: names.len(),
                max: self.max_params,
            });
        }

        let mut node = self.trees.entry(method.to_owned()).or_default();
        for segment in &segments {
            node = match *segment {
                Segment::Literal(literal) => node.literals.entry(literal.to_owned()).or_default(),
                Segment::Param(name) => {
                    let child = node.param.get_or_insert_with(|| {
                        Box::new(Child {
                            name: name.to_owned(),
                            node: Node::default(),
                        })
                    });
                    if child.name != name {
                        return Err(RouteError::ParamConflict {
                            path: path.clone(),
                            existing: child.name.clone(),
                            name: name.to_owned(),
                        });
                    }
                    &mut child.node
                }
                Segment::Wildcard(name) => {
                    let child = node.wildcard.get_or_insert_with(|| {
                        Box::new(Child {
                            name: name.to_owned(),
                            node: Node::default(),
                        })
                    });
                    if child.name != name {
                        return Err(RouteError::ParamConflict {
                            path: path.clone(),
                            existing: child.name.clone(),
                            name: name.to_owned(),
                        });
                    }
                    &mut child.node
                }
            };
        }

        if node.endpoint.is_some() {
            return Err(RouteError::Duplicate {
                method: method.to_owned(),
                path,
            });
        }

        let count = names.len();
        node.endpoint = Some(Endpoint {
            handler,
            names: names.into(),
        });

        if !name.is_empty() {
            self.names.insert(name.to_owned(), path.clone());
        }
        self.routes.push(RouteInfo {
            name: name.to_owned(),
            method: method.to_owned(),
            path,
        });
        Ok(count)
    }

    /// Finds the handler registered for `method` and `path`.
    ///
    /// On a match `params` holds the captured parameters; on a miss it is
    /// left empty.
    pub fn find(&self, method: &str, path: &str, params: &mut Params) -> Option<Handler> {
        params.clear();
        let tree = self.trees.get(method)?;
        let rest = self.split_root(path)?;

        match tree.lookup(rest, &mut params.values) {
            Some(endpoint) => {
                params.names.extend(endpoint.names.iter().cloned());
                Some(endpoint.handler.clone())
            }
            None => {
                params.values.clear();
                None
            }
        }
    }

    /// Returns the methods, in lexical order, having a route that matches
    /// `path`.
    pub fn allowed_methods(&self, path: &str) -> Vec<&str> {
        let rest = match self.split_root(path) {
            Some(rest) => rest,
            None => return Vec::new(),
        };

        let mut scratch = Vec::new();
        self.trees
            .iter()
            .filter(|(_, tree)| {
                scratch.clear();
                tree.lookup(rest, &mut scratch).is_some()
            })
            .map(|(method, _)| method.as_str())
            .collect()
    }

    /// Visits every registered route in registration order.
    pub fn each<F>(&self, mut visit: F)
    where
        F: FnMut(&str, &str, &str),
    {
        for route in &self.routes {
            visit(&route.name, &route.method, &route.path);
        }
    }

    pub fn routes(&self) -> &[RouteInfo] {
        &self.routes
    }

    /// Builds the path of the route named `name`, filling its parameters in
    /// order with `params`.
    ///
    /// Returns `None` if no route has that name or if too few parameters are
    /// given.
    pub fn url(&self, name: &str, params: &[&dyn fmt::Display]) -> Option<String> {
        let pattern = self.names.get(name)?;
        let mut values = params.iter();
        let mut url = String::with_capacity(pattern.len());
        for (i, segment) in pattern.split('/').enumerate() {
            if i > 0 {
                url.push('/');
            }
            if segment.starts_with(':') || segment.starts_with('*') {
                write!(url, "{}", values.next()?).ok()?;
            } else {
                url.push_str(segment);
            }
        }
        Some(url)
    }

    /// The largest parameter count among the registered routes.
    pub fn max_param_count(&self) -> usize {
        self.routes
            .iter()
            .map(|route| {
                route
                    .path
                    .split('/')
                    .filter(|s| s.starts_with(':') || s.starts_with('*'))
                    .count()
            })
            .max()
            .unwrap_or(0)
    }

    /// Splits off the leading slash. `None` means the path cannot match;
    /// `Some(None)` is the root.
    #[allow(clippy::option_option)]
    fn split_root<'p>(&self, path: &'p str) -> Option<Option<&'p str>> {
        let rest = self.normalize(path).strip_prefix('/')?;
        Some(if rest.is_empty() { None } else { Some(rest) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::nothing_handler;

    fn router() -> Router {
        Router::new(&Config::default())
    }

    fn same(a: &Handler, b: &Handler) -> bool {
        Arc::as_ptr(a) as *const u8 == Arc::as_ptr(b) as *const u8
    }

    /// Tests that a literal route wins over a parameter at the same position.
    #[test]
    fn test_literal_precedence() {
        let mut router = router();
        let by_id = nothing_handler();
        let new = nothing_handler();
        router.add("", "GET", "/users/:id", by_id.clone()).unwrap();
        router.add("", "GET", "/users/new", new.clone()).unwrap();

        let mut params = Params::default();
        let found = router.find("GET", "/users/new", &mut params).unwrap();
        assert!(same(&found, &new));
        assert!(params.is_empty());

        let found = router.find("GET", "/users/42", &mut params).unwrap();
        assert!(same(&found, &by_id));
        assert_eq!(params.get("id"), Some("42"));
    }

    /// Tests that the lookup backtracks from a literal branch without a route.
    #[test]
    fn test_backtracking() {
        let mut router = router();
        let literal = nothing_handler();
        let param = nothing_handler();
        router.add("", "GET", "/a/b/c", literal.clone()).unwrap();
        router.add("", "GET", "/a/:x/d", param.clone()).unwrap();

        let mut params = Params::default();
        let found = router.find("GET", "/a/b/d", &mut params).unwrap();
        assert!(same(&found, &param));
        assert_eq!(params.get("x"), Some("b"));

        let found = router.find("GET", "/a/b/c", &mut params).unwrap();
        assert!(same(&found, &literal));
        assert!(params.is_empty());
    }

    /// Tests that a wildcard captures the remainder of the path.
    #[test]
    fn test_wildcard_capture() {
        let mut router = router();
        router.add("", "GET", "/files/*rest", nothing_handler()).unwrap();

        let mut params = Params::default();
        assert!(router.find("GET", "/files/a/b/c", &mut params).is_some());
        assert_eq!(params.get("rest"), Some("a/b/c"));
        assert!(router.find("GET", "/files", &mut params).is_none());
        assert!(params.is_empty());
    }

    /// Tests the fixed order parameter-then-wildcard at one position.
    #[test]
    fn test_param_before_wildcard() {
        let mut router = router();
        let param = nothing_handler();
        let wildcard = nothing_handler();
        router.add("", "GET", "/s/:name", param.clone()).unwrap();
        router.add("", "GET", "/s/*", wildcard.clone()).unwrap();

        let mut params = Params::default();
        let found = router.find("GET", "/s/one", &mut params).unwrap();
        assert!(same(&found, &param));
        assert_eq!(params.get("name"), Some("one"));

        let found = router.find("GET", "/s/one/two", &mut params).unwrap();
        assert!(same(&found, &wildcard));
        assert_eq!(params.get("*"), Some("one/two"));
    }

    /// Tests that parameters keep their path order.
    #[test]
    fn test_multiple_params() {
        let mut router = router();
        let count = router
            .add("", "GET", "/repos/:owner/:repo/tree/*path", nothing_handler())
            .unwrap();
        assert_eq!(count, 3);

        let mut params = Params::default();
        router
            .find("GET", "/repos/rust-lang/rust/tree/src/lib.rs", &mut params)
            .unwrap();
        let pairs: Vec<_> = params.iter().collect();
        assert_eq!(
            pairs,
            vec![("owner", "rust-lang"), ("repo", "rust"), ("path", "src/lib.rs")]
        );
    }

    /// Tests that by default the trailing slash is ignored.
    #[test]
    fn test_trailing_slash_stripped() {
        let mut router = router();
        router.add("", "GET", "/users/", nothing_handler()).unwrap();

        let mut params = Params::default();
        assert!(router.find("GET", "/users", &mut params).is_some());
        assert!(router.find("GET", "/users/", &mut params).is_some());
        assert_eq!(router.routes()[0].path, "/users");
    }

    /// Tests that keeping the trailing slash makes both forms distinct.
    #[test]
    fn test_trailing_slash_kept() {
        let config = Config {
            keep_trailing_slash: true,
            ..Config::default()
        };
        let mut router = Router::new(&config);
        let slash = nothing_handler();
        router.add("", "GET", "/users/", slash.clone()).unwrap();

        let mut params = Params::default();
        assert!(router.find("GET", "/users", &mut params).is_none());
        let found = router.find("GET", "/users/", &mut params).unwrap();
        assert!(same(&found, &slash));

        router.add("", "GET", "/users", nothing_handler()).unwrap();
        let found = router.find("GET", "/users", &mut params).unwrap();
        assert!(!same(&found, &slash));
    }

    /// Tests the root route.
    #[test]
    fn test_root() {
        let mut router = router();
        router.add("", "GET", "/", nothing_handler()).unwrap();

        let mut params = Params::default();
        assert!(router.find("GET", "/", &mut params).is_some());
        assert!(router.find("GET", "/x", &mut params).is_none());
        assert!(router.find("POST", "/", &mut params).is_none());
    }

    /// Tests the configuration errors of `add`.
    #[test]
    fn test_add_errors() {
        let mut router = router();
        router.add("", "GET", "/users/:id", nothing_handler()).unwrap();

        assert!(matches!(
            router.add("", "GET", "/users/:name/posts", nothing_handler()),
            Err(RouteError::ParamConflict { .. })
        ));
        assert!(matches!(
            router.add("", "GET", "/users/:id", nothing_handler()),
            Err(RouteError::Duplicate { .. })
        ));
        assert!(matches!(
            router.add("", "GET", "users", nothing_handler()),
            Err(RouteError::InvalidPath { .. })
        ));
        assert!(matches!(
            router.add("", "GET", "/a//b", nothing_handler()),
            Err(RouteError::InvalidPath { .. })
        ));
        assert!(matches!(
            router.add("", "GET", "/a/:/b", nothing_handler()),
            Err(RouteError::InvalidPath { .. })
        ));
        assert!(matches!(
            router.add("", "GET", "/a/*rest/b", nothing_handler()),
            Err(RouteError::InvalidPath { .. })
        ));

        // Another method has its own tree.
        assert!(router.add("", "POST", "/users/:name", nothing_handler()).is_ok());
    }

    /// Tests the parameter limit.
    #[test]
    fn test_too_many_params() {
        let config = Config {
            max_params: 2,
            ..Config::default()
        };
        let mut router = Router::new(&config);
        assert_eq!(router.add("", "GET", "/:a/:b", nothing_handler()), Ok(2));
        assert!(matches!(
            router.add("", "GET", "/:a/:b/:c", nothing_handler()),
            Err(RouteError::TooManyParams { count: 3, max: 2, .. })
        ));
        assert_eq!(router.max_param_count(), 2);
    }

    /// Tests the methods reported for a path.
    #[test]
    fn test_allowed_methods() {
        let mut router = router();
        router.add("", "PUT", "/items/:id", nothing_handler()).unwrap();
        router.add("", "GET", "/items/:id", nothing_handler()).unwrap();
        router.add("", "POST", "/items", nothing_handler()).unwrap();

        assert_eq!(router.allowed_methods("/items/7"), vec!["GET", "PUT"]);
        assert_eq!(router.allowed_methods("/items"), vec!["POST"]);
        assert!(router.allowed_methods("/nothing").is_empty());
    }

    /// Tests URL generation from named routes.
    #[test]
    fn test_url() {
        let mut router = router();
        router
            .add("user_post", "GET", "/users/:id/posts/:post", nothing_handler())
            .unwrap();
        router.add("root", "GET", "/", nothing_handler()).unwrap();

        assert_eq!(
            router.url("user_post", &[&42, &"first"]),
            Some("/users/42/posts/first".to_owned())
        );
        assert_eq!(router.url("root", &[]), Some("/".to_owned()));
        assert_eq!(router.url("user_post", &[&42]), None);
        assert_eq!(router.url("missing", &[]), None);
    }

    /// Tests the traversal order.
    #[test]
    fn test_each() {
        let mut router = router();
        router.add("a", "GET", "/a", nothing_handler()).unwrap();
        router.add("", "POST", "/b", nothing_handler()).unwrap();

        let mut seen = Vec::new();
        router.each(|name, method, path| seen.push(format!("{} {} {}", name, method, path)));
        assert_eq!(seen, vec!["a GET /a", " POST /b"]);
    }

    /// Tests that a failed lookup leaves no stale values behind.
    #[test]
    fn test_params_cleared_on_miss() {
        let mut router = router();
        router.add("", "GET", "/a/:x/end", nothing_handler()).unwrap();

        let mut params = Params::with_capacity(4);
        assert!(router.find("GET", "/a/1/other", &mut params).is_none());
        assert!(params.is_empty());
        assert!(params.capacity() >= 4);
    }
}
