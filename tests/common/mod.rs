#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use opa_scraper::{FetchError, Identifier, ResourceSource};
use serde_json::{json, Value};

/// Canned API document for one account.
pub fn property_document(account: Identifier) -> Value {
    json!({
        "status": "success",
        "data": {
            "property": {
                "property_id": account.to_string(),
                "account_number": account.to_string(),
                "full_address": format!("{} MARKET ST", account),
                "unit": "",
                "zip": "19107",
                "ownership": [{"name": "OWNER", "street": "1 MAIN ST", "city": "PHILADELPHIA", "state": "PA", "zip": "19102"}],
                "characteristics": {"description": "ROW 2 STY", "land_area": 1440, "homestead": true},
                "sales_information": {"sales_date": "/Date(1609459200000-0500)", "sales_price": 250000.5, "sales_type": "D"},
                "geometry": {"x": 2694011.25, "y": 236060},
                "valuation_history": [
                    {"certification_year": 2014, "market_value": 100000, "certified": true},
                    {"certification_year": 2013, "market_value": 90000, "certified": false}
                ]
            }
        }
    })
}

pub fn error_document() -> Value {
    json!({"status": "error", "data": null, "message": "Account not found"})
}

/// In-memory source; identifiers without a body fail like a network error.
#[derive(Default)]
pub struct MapSource {
    bodies: HashMap<Identifier, Vec<u8>>,
    requested: Mutex<Vec<Identifier>>,
}

impl MapSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_body(mut self, id: Identifier, body: impl Into<Vec<u8>>) -> Self {
        self.bodies.insert(id, body.into());
        self
    }

    pub fn with_document(self, id: Identifier, document: &Value) -> Self {
        let body = serde_json::to_vec(document).unwrap();
        self.with_body(id, body)
    }

    pub fn requested(&self) -> Vec<Identifier> {
        self.requested.lock().unwrap().clone()
    }
}

impl ResourceSource for MapSource {
    fn fetch(&self, id: Identifier) -> Result<Vec<u8>, FetchError> {
        self.requested.lock().unwrap().push(id);
        self.bodies
            .get(&id)
            .cloned()
            .ok_or_else(|| FetchError::Other(format!("connection reset for {}", id)))
    }
}

/// Loopback HTTP responder serving `connections` requests, one per
/// connection. Bodies are looked up by the last path segment; unknown
/// identifiers get a 404 with a JSON error body.
pub struct TestServer {
    pub addr: SocketAddr,
    pub paths: Arc<Mutex<Vec<String>>>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    pub fn start(bodies: HashMap<Identifier, String>, connections: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let paths = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&paths);
        let handle = thread::spawn(move || {
            for stream in listener.incoming().take(connections) {
                let mut stream = match stream {
                    Ok(s) => s,
                    Err(_) => continue,
                };
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let text = String::from_utf8_lossy(&request);
                let path = text.split_whitespace().nth(1).unwrap_or("").to_string();
                seen.lock().unwrap().push(path.clone());

                let id = path
                    .split('?')
                    .next()
                    .and_then(|p| p.rsplit('/').next())
                    .and_then(|s| s.parse::<Identifier>().ok());
                let (status, body) = match id.and_then(|id| bodies.get(&id)) {
                    Some(body) => ("200 OK", body.clone()),
                    None => ("404 Not Found", r#"{"status":"error","data":null}"#.to_string()),
                };
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes());
                let _ = stream.flush();
            }
        });
        Self { addr, paths, handle: Some(handle) }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}/OPA/v1.0/account", self.addr)
    }

    pub fn join(mut self) -> Vec<String> {
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap();
        }
        self.paths.lock().unwrap().clone()
    }
}
