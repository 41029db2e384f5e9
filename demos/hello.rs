//! A small application showing routes, groups, middlewares and the shutdown
//! hooks of Ship.
//!
//! Run it with `cargo run --example hello`, then try:
//!
//! ```text
//! curl localhost:3000/hello/ferris
//! curl -X POST -H 'Content-Type: application/json' -d '{"text":"hi"}' localhost:3000/api/notes
//! curl localhost:3000/api/notes/0
//! ```

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use ship::{middleware, Config, HttpError, Ship, StatusCode};

#[derive(Clone, Serialize, Deserialize)]
struct Note {
    text: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::new().unwrap_or_else(|err| {
        log::warn!("using the default configuration: {}", err);
        Config::default()
    });
    let mut ship = Ship::with_config(Config {
        name: "hello".to_owned(),
        ..config
    });
    ship.pre([middleware::recover(), middleware::logger()])?;

    ship.route("/")
        .get(|ctx| ctx.html(StatusCode::OK, "<h1>Welcome to Ship!</h1>"))?;
    ship.route("/hello/:name")
        .name("hello")
        .get(|ctx| {
            let name = ctx.param("name").unwrap_or("world").to_owned();
            ctx.render("jsonpretty", StatusCode::OK, &serde_json::json!({ "hello": name }))
        })?;

    let notes = Arc::new(Mutex::new(Vec::<Note>::new()));
    let mut api = ship.group("/api");
    {
        let notes = notes.clone();
        api.route("/notes").post(move |ctx| {
            let note: Note = ctx.bind()?;
            let id = {
                let mut notes = notes.lock().unwrap_or_else(|p| p.into_inner());
                notes.push(note);
                notes.len() - 1
            };
            let location = ctx.url("note", &[&id]).unwrap_or_default();
            ctx.set_header("Location", &location)?;
            ctx.json(StatusCode::CREATED, &serde_json::json!({ "id": id }))
        })?;
    }
    api.route("/notes/:id").name("note").get(move |ctx| {
        let id: usize = ctx
            .param("id")
            .and_then(|id| id.parse().ok())
            .ok_or_else(|| HttpError::bad_request().with_message("invalid note id"))?;
        let note = notes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(HttpError::not_found)?;
        ctx.json(StatusCode::OK, &note)
    })?;

    ship.register_on_shutdown(|| log::info!("goodbye"));

    let ship = Arc::new(ship);
    ship.start("127.0.0.1:3000")?;
    ship.wait();
    Ok(())
}
