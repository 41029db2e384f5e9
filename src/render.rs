use std::collections::HashMap;
use std::sync::Arc;

use hyper::StatusCode;
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::Value;

use crate::context::{Context, MIME_APPLICATION_JSON};
use crate::error::{Error, Result};

/// Produces a response body for a named format.
pub trait Renderer: Send + Sync {
    fn render(&self, ctx: &mut Context, name: &str, status: StatusCode, data: &Value) -> Result;
}

impl<F> Renderer for F
where
    F: Fn(&mut Context, &str, StatusCode, &Value) -> Result + Send + Sync,
{
    fn render(&self, ctx: &mut Context, name: &str, status: StatusCode, data: &Value) -> Result {
        self(ctx, name, status, data)
    }
}

/// Dispatches to the renderer registered under the requested name.
#[derive(Clone, Default)]
pub struct MuxRenderer {
    renderers: HashMap<String, Arc<dyn Renderer>>,
}

impl MuxRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `renderer` as `name`, replacing any previous one.
    pub fn add(&mut self, name: impl Into<String>, renderer: impl Renderer + 'static) -> &mut Self {
        self.renderers.insert(name.into(), Arc::new(renderer));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Renderer>> {
        self.renderers.get(name)
    }
}

impl Renderer for MuxRenderer {
    fn render(&self, ctx: &mut Context, name: &str, status: StatusCode, data: &Value) -> Result {
        match self.renderers.get(name) {
            Some(renderer) => renderer.render(ctx, name, status, data),
            None => Err(Error::msg(format_args!("no renderer named '{}'", name))),
        }
    }
}

/// Renders the value as JSON, indented by four spaces when `pretty`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRenderer {
    pub pretty: bool,
}

impl Renderer for JsonRenderer {
    fn render(&self, ctx: &mut Context, _: &str, status: StatusCode, data: &Value) -> Result {
        let mut buf = ctx.acquire_buffer();
        if self.pretty {
            let formatter = PrettyFormatter::with_indent(b"    ");
            let mut ser = serde_json::Serializer::with_formatter(&mut *buf, formatter);
            data.serialize(&mut ser)?;
        } else {
            serde_json::to_writer(&mut *buf, data)?;
        }
        ctx.blob(status, MIME_APPLICATION_JSON, &buf[..])
    }
}

/// The renderer installed by default: "json" and "jsonpretty".
pub fn default_renderer() -> MuxRenderer {
    let mut mux = MuxRenderer::new();
    mux.add("json", JsonRenderer { pretty: false })
        .add("jsonpretty", JsonRenderer { pretty: true });
    mux
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Shared;
    use serde_json::json;

    fn context() -> Context {
        let mut shared = Shared::new(false, 64, 0);
        shared.renderer = Some(Arc::new(default_renderer()));
        Context::new(Arc::new(shared))
    }

    /// Tests rendering by name through the context.
    #[test]
    fn test_render_json() {
        let mut ctx = context();
        ctx.render("json", StatusCode::OK, &json!({"a": 1})).unwrap();
        assert_eq!(ctx.response().body(), br#"{"a":1}"#);
    }

    /// Tests the four-space indentation of the pretty variant.
    #[test]
    fn test_render_json_pretty() {
        let mut ctx = context();
        ctx.render("jsonpretty", StatusCode::ACCEPTED, &json!({"a": 1}))
            .unwrap();
        assert_eq!(ctx.response().status(), StatusCode::ACCEPTED);
        assert_eq!(ctx.response().body(), b"{\n    \"a\": 1\n}");
    }

    /// Tests that an unknown name is an error.
    #[test]
    fn test_render_unknown() {
        let mut ctx = context();
        assert!(ctx.render("xml", StatusCode::OK, &json!(null)).is_err());
        assert!(!ctx.response().is_committed());
    }

    /// Tests that closures act as renderers.
    #[test]
    fn test_closure_renderer() {
        let mut mux = MuxRenderer::new();
        mux.add(
            "upper",
            |ctx: &mut Context, _: &str, status: StatusCode, data: &Value| {
                ctx.text(status, data.as_str().unwrap_or_default().to_uppercase())
            },
        );
        let mut shared = Shared::new(false, 64, 0);
        shared.renderer = Some(Arc::new(mux));
        let mut ctx = Context::new(Arc::new(shared));

        ctx.render("upper", StatusCode::OK, "ship").unwrap();
        assert_eq!(ctx.response().body(), b"SHIP");
    }
}
