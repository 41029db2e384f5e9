//! Route registration builders.

use hyper::Method;

use crate::context::Context;
use crate::error::{Result, RouteError};
use crate::handler::{handler, Handler, Middleware};
use crate::ship::Ship;

/// The methods registered by [`Route::any`].
const ANY_METHODS: [Method; 9] = [
    Method::CONNECT,
    Method::DELETE,
    Method::GET,
    Method::HEAD,
    Method::OPTIONS,
    Method::PATCH,
    Method::POST,
    Method::PUT,
    Method::TRACE,
];

/// A set of routes sharing a path prefix and a middleware list.
///
/// ```
/// # use ship::{Ship, StatusCode};
/// let mut ship = Ship::new();
/// let mut api = ship.group("/api");
/// api.route("/ping")
///     .get(|ctx| ctx.text(StatusCode::OK, "pong"))
///     .unwrap();
/// assert_eq!(ship.routes()[0].path, "/api/ping");
/// ```
pub struct Group<'a> {
    ship: &'a mut Ship,
    prefix: String,
    middlewares: Vec<Middleware>,
}

impl<'a> Group<'a> {
    pub(crate) fn new(ship: &'a mut Ship, prefix: String, middlewares: Vec<Middleware>) -> Self {
        Group {
            ship,
            prefix: prefix.trim_end_matches('/').to_owned(),
            middlewares,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Appends middlewares applied to the routes registered afterwards
    /// through this group.
    pub fn use_middleware<I>(&mut self, middlewares: I) -> Result<&mut Self, RouteError>
    where
        I: IntoIterator<Item = Middleware>,
    {
        let middlewares: Vec<_> = middlewares.into_iter().collect();
        self.ship
            .check_middlewares(self.middlewares.len() + middlewares.len())?;
        self.middlewares.extend(middlewares);
        Ok(self)
    }

    /// Creates a sub-group inheriting the prefix and the middlewares.
    pub fn group(&mut self, prefix: &str) -> Group<'_> {
        let prefix = format!("{}{}", self.prefix, prefix);
        Group::new(self.ship, prefix, self.middlewares.clone())
    }

    /// Creates a sub-group inheriting only the prefix.
    pub fn group_without_middleware(&mut self, prefix: &str) -> Group<'_> {
        let prefix = format!("{}{}", self.prefix, prefix);
        Group::new(self.ship, prefix, Vec::new())
    }

    pub fn route(&mut self, path: &str) -> Route<'_> {
        let path = format!("{}{}", self.prefix, path);
        Route::new(self.ship, path, self.middlewares.clone())
    }

    pub fn route_without_middleware(&mut self, path: &str) -> Route<'_> {
        let path = format!("{}{}", self.prefix, path);
        Route::new(self.ship, path, Vec::new())
    }
}

/// The routes of one path, registered method by method.
///
/// ```
/// # use ship::{Ship, StatusCode};
/// let mut ship = Ship::new();
/// ship.route("/users/:id")
///     .name("user")
///     .get(|ctx| {
///         let id = ctx.param("id").unwrap_or_default().to_owned();
///         ctx.text(StatusCode::OK, id)
///     })
///     .unwrap()
///     .delete(|ctx| ctx.no_content(StatusCode::NO_CONTENT))
///     .unwrap();
/// assert_eq!(ship.url("user", &[&42]).as_deref(), Some("/users/42"));
/// ```
pub struct Route<'a> {
    ship: &'a mut Ship,
    path: String,
    name: String,
    middlewares: Vec<Middleware>,
}

impl<'a> Route<'a> {
    pub(crate) fn new(ship: &'a mut Ship, path: String, middlewares: Vec<Middleware>) -> Self {
        Route {
            ship,
            path,
            name: String::new(),
            middlewares,
        }
    }

    /// Names the route for [`Ship::url`].
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Appends a middleware applied only to this route.
    pub fn with(mut self, middleware: Middleware) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Registers `handler` for `method`.
    pub fn handle(self, method: Method, handler: Handler) -> Result<Self, RouteError> {
        self.ship
            .add_route(&self.name, &method, &self.path, handler, &self.middlewares)?;
        Ok(self)
    }

    pub fn method<F>(self, method: Method, f: F) -> Result<Self, RouteError>
    where
        F: Fn(&mut Context) -> Result + Send + Sync + 'static,
    {
        self.handle(method, handler(f))
    }

    pub fn get<F>(self, f: F) -> Result<Self, RouteError>
    where
        F: Fn(&mut Context) -> Result + Send + Sync + 'static,
    {
        self.method(Method::GET, f)
    }

    pub fn post<F>(self, f: F) -> Result<Self, RouteError>
    where
        F: Fn(&mut Context) -> Result + Send + Sync + 'static,
    {
        self.method(Method::POST, f)
    }

    pub fn put<F>(self, f: F) -> Result<Self, RouteError>
    where
        F: Fn(&mut Context) -> Result + Send + Sync + 'static,
    {
        self.method(Method::PUT, f)
    }

    pub fn patch<F>(self, f: F) -> Result<Self, RouteError>
    where
        F: Fn(&mut Context) -> Result + Send + Sync + 'static,
    {
        self.method(Method::PATCH, f)
    }

    pub fn delete<F>(self, f: F) -> Result<Self, RouteError>
    where
        F: Fn(&mut Context) -> Result + Send + Sync + 'static,
    {
        self.method(Method::DELETE, f)
    }

    pub fn head<F>(self, f: F) -> Result<Self, RouteError>
    where
        F: Fn(&mut Context) -> Result + Send + Sync + 'static,
    {
        self.method(Method::HEAD, f)
    }

    pub fn options<F>(self, f: F) -> Result<Self, RouteError>
    where
        F: Fn(&mut Context) -> Result + Send + Sync + 'static,
    {
        self.method(Method::OPTIONS, f)
    }

    /// Registers `f` for every standard method.
    pub fn any<F>(mut self, f: F) -> Result<Self, RouteError>
    where
        F: Fn(&mut Context) -> Result + Send + Sync + 'static,
    {
        let handler = handler(f);
        for method in ANY_METHODS {
            self = self.handle(method, handler.clone())?;
        }
        Ok(self)
    }
}
