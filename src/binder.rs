use serde_json::Value;

use crate::context::Context;
use crate::error::{HttpError, Result};

/// Decodes the request into a dynamic value that
/// [`Context::bind`](crate::Context::bind) then converts into the target type.
pub trait Binder: Send + Sync {
    fn bind(&self, ctx: &mut Context) -> Result<Value>;
}

impl<F> Binder for F
where
    F: Fn(&mut Context) -> Result<Value> + Send + Sync,
{
    fn bind(&self, ctx: &mut Context) -> Result<Value> {
        self(ctx)
    }
}

/// Binds JSON request bodies.
///
/// Other media types are rejected with "415 Unsupported Media Type"; an empty
/// or malformed body is a "400 Bad Request".
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonBinder;

impl Binder for JsonBinder {
    fn bind(&self, ctx: &mut Context) -> Result<Value> {
        let is_json = ctx
            .content_type()
            .and_then(|ct| ct.split(';').next())
            .map(|mime| mime.trim().eq_ignore_ascii_case("application/json"))
            .unwrap_or(false);
        if !is_json {
            return Err(HttpError::unsupported_media_type().into());
        }

        let body = ctx.body_bytes()?;
        if body.is_empty() {
            return Err(HttpError::bad_request()
                .with_message("empty request body")
                .into());
        }
        serde_json::from_slice(&body).map_err(|err| HttpError::bad_request().with_cause(err).into())
    }
}
