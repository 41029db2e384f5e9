use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::Deserialize;
use ship::{Config, HttpError, ServerError, Ship, StatusCode};

fn config(name: &str) -> Config {
    Config {
        name: name.to_owned(),
        signals: Vec::new(),
        max_workers: 4,
        ..Config::default()
    }
}

fn send(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(request.as_bytes()).unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    response
}

fn get(addr: SocketAddr, host: &str, path: &str) -> String {
    send(
        addr,
        &format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            path, host
        ),
    )
}

#[derive(Deserialize)]
struct Greeting {
    name: String,
}

/// Tests routing, binding and the fallbacks over a real connection.
#[test]
fn test_serve_requests() {
    let mut ship = Ship::with_config(config("api"));
    ship.route("/hello/:name")
        .get(|ctx| {
            let text = format!("hello {}", ctx.param("name").unwrap_or_default());
            ctx.text(StatusCode::OK, text)
        })
        .unwrap()
        .post(|ctx| {
            let greeting: Greeting = ctx.bind()?;
            if greeting.name.is_empty() {
                return Err(HttpError::bad_request().with_message("empty name").into());
            }
            ctx.json(StatusCode::CREATED, &serde_json::json!({ "greeted": greeting.name }))
        })
        .unwrap();

    let ship = Arc::new(ship);
    let addr = ship.start("127.0.0.1:0").unwrap();

    let response = get(addr, "localhost", "/hello/ship");
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.ends_with("hello ship"));

    let body = r#"{"name":"ferris"}"#;
    let response = send(
        addr,
        &format!(
            "POST /hello/x HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        ),
    );
    assert!(response.starts_with("HTTP/1.1 201 Created"));
    assert!(response.ends_with(r#"{"greeted":"ferris"}"#));

    let body = r#"{"name":""}"#;
    let response = send(
        addr,
        &format!(
            "POST /hello/x HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        ),
    );
    assert!(response.starts_with("HTTP/1.1 400 Bad Request"));
    assert!(response.ends_with("empty name"));

    let response = get(addr, "localhost", "/nowhere");
    assert!(response.starts_with("HTTP/1.1 404 Not Found"));

    let response = send(
        addr,
        "DELETE /hello/x HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    );
    assert!(response.starts_with("HTTP/1.1 405 Method Not Allowed"));
    assert!(response.to_ascii_lowercase().contains("allow: get, post"));

    ship.shutdown(Duration::from_secs(1)).unwrap();
}

/// Tests reading a request body that arrives after the headers.
#[test]
fn test_serve_split_body() {
    let mut ship = Ship::with_config(config("echo"));
    ship.route("/echo")
        .post(|ctx| {
            let body = ctx.body_bytes()?;
            ctx.blob(StatusCode::OK, "application/octet-stream", body)
        })
        .unwrap();

    let ship = Arc::new(ship);
    let addr = ship.start("127.0.0.1:0").unwrap();

    let response = send(
        addr,
        "POST /echo HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
    );
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.ends_with("hello"));

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .write_all(b"POST /echo HTTP/1.1\r\nHost: localhost\r\nContent-Length: 11\r\nConnection: close\r\n\r\n")
        .unwrap();
    stream.flush().unwrap();
    thread::sleep(Duration::from_millis(200));
    stream.write_all(b"hello ").unwrap();
    thread::sleep(Duration::from_millis(100));
    stream.write_all(b"world").unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.ends_with("hello world"));

    ship.shutdown(Duration::MAX).unwrap();
}

/// Tests that a handler panic without the recovery middleware fails only
/// its own request.
#[test]
fn test_serve_after_panic() {
    let mut ship = Ship::with_config(Config {
        max_workers: 1,
        ..config("panics")
    });
    ship.route("/boom").get(|_| panic!("handler failure")).unwrap();
    ship.route("/ok").get(|ctx| ctx.text(StatusCode::OK, "fine")).unwrap();

    let ship = Arc::new(ship);
    let addr = ship.start("127.0.0.1:0").unwrap();

    for _ in 0..3 {
        let response = get(addr, "localhost", "/boom");
        assert!(response.starts_with("HTTP/1.1 500 Internal Server Error"));
    }
    let response = get(addr, "localhost", "/ok");
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.ends_with("fine"));

    ship.shutdown(Duration::from_secs(1)).unwrap();
}

/// Tests that virtual hosts are selected by the Host header.
#[test]
fn test_serve_vhosts() {
    let mut ship = Ship::with_config(config("hosts"));
    ship.route("/").get(|ctx| ctx.text(StatusCode::OK, "main")).unwrap();
    ship.vhost("docs.local")
        .unwrap()
        .route("/")
        .get(|ctx| ctx.text(StatusCode::OK, "docs"))
        .unwrap();

    let ship = Arc::new(ship);
    let addr = ship.start("127.0.0.1:0").unwrap();
    assert!(get(addr, "docs.local", "/").ends_with("docs"));
    assert!(get(addr, "other.local", "/").ends_with("main"));
    ship.shutdown(Duration::from_secs(1)).unwrap();
}

/// Tests that the shutdown lets an in-flight request finish and then runs
/// the callbacks in reverse registration order.
#[test]
fn test_graceful_shutdown() {
    let (entered_tx, entered_rx) = mpsc::channel();
    let entered_tx = Mutex::new(entered_tx);

    let mut ship = Ship::with_config(config("graceful"));
    ship.route("/slow")
        .get(move |ctx| {
            let _ = entered_tx.lock().unwrap().send(());
            thread::sleep(Duration::from_millis(200));
            ctx.text(StatusCode::OK, "done")
        })
        .unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 1..=3 {
        let order = order.clone();
        ship.register_on_shutdown(move || order.lock().unwrap().push(i));
    }

    let ship = Arc::new(ship);
    let addr = ship.start("127.0.0.1:0").unwrap();
    assert!(matches!(
        ship.start("127.0.0.1:0"),
        Err(ServerError::AlreadyStarted)
    ));

    let client = thread::spawn(move || get(addr, "localhost", "/slow"));
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    ship.shutdown(Duration::from_secs(5)).unwrap();
    let response = client.join().unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.ends_with("done"));

    assert_eq!(*order.lock().unwrap(), vec![3, 2, 1]);
    assert!(ship.lifecycle().is_finished());
    assert!(TcpStream::connect(addr).is_err());

    // A second shutdown is a no-op.
    ship.shutdown(Duration::from_secs(1)).unwrap();
}

/// Tests that stopping one of two linked servers stops both.
#[test]
fn test_linked_servers() {
    let public = Ship::with_config(config("public"));
    let admin = Ship::with_config(config("admin"));
    public.link(&admin);

    let public = Arc::new(public);
    let admin = Arc::new(admin);
    public.start("127.0.0.1:0").unwrap();
    let admin_addr = admin.start("127.0.0.1:0").unwrap();

    public.trigger_shutdown();
    assert!(public.wait_timeout(Duration::from_secs(5)));
    assert!(admin.wait_timeout(Duration::from_secs(5)));
    assert!(TcpStream::connect(admin_addr).is_err());
}
