//! In-memory bucket + broker pair for integration tests.
//!
//! A single wiremock server plays both roles: `/watchdemon/authenticate`
//! hands out "presigned" URLs pointing back at `/bucket/...` on the same
//! server, which serves a byte map shared with the test body.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use common::prelude::ClerkConfig;
use wiremock::matchers::any;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

pub struct TestBucket {
    pub server: MockServer,
    objects: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl TestBucket {
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        let objects = Arc::new(Mutex::new(BTreeMap::new()));
        Mock::given(any())
            .respond_with(BucketResponder {
                base: server.uri(),
                objects: objects.clone(),
            })
            .mount(&server)
            .await;
        Self { server, objects }
    }

    /// A validated-shape config pointing at this server.
    pub fn config(&self, device: &str) -> ClerkConfig {
        ClerkConfig {
            secret_key: "shared test secret".into(),
            // keep scrypt cheap in tests
            work_factor: 2,
            broker_url: self.server.uri(),
            bucket_prefix: format!("{}/bucket/", self.server.uri()),
            device_name: device.into(),
            device_token: "device-token".into(),
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    /// Duplicate an object under a second path, bytes untouched.
    pub fn copy(&self, from: &str, to: &str) {
        let mut objects = self.objects.lock().unwrap();
        let data = objects.get(from).expect("copy source exists").clone();
        objects.insert(to.to_string(), data);
    }

    /// Flip one ciphertext byte.
    pub fn tamper(&self, key: &str) {
        let mut objects = self.objects.lock().unwrap();
        let data = objects.get_mut(key).expect("tamper target exists");
        let mid = data.len() / 2;
        data[mid] ^= 0xff;
    }

    /// How many broker authentications of the given mode have happened.
    pub async fn authentications(&self, mode: &str) -> usize {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| {
                r.url.path() == "/watchdemon/authenticate"
                    && parse_form(&r.body).get("mode").map(String::as_str) == Some(mode)
            })
            .count()
    }
}

fn parse_form(body: &[u8]) -> HashMap<String, String> {
    url::form_urlencoded::parse(body).into_owned().collect()
}

fn encode_key(key: &str) -> String {
    key.replace('#', "%23")
}

fn decode_key(path: &str) -> String {
    path.replace("%23", "#")
}

struct BucketResponder {
    base: String,
    objects: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl BucketResponder {
    fn authenticate(&self, request: &Request) -> ResponseTemplate {
        let form = parse_form(&request.body);
        let key = form.get("key").cloned().unwrap_or_default();
        match form.get("mode").map(String::as_str) {
            Some("List") => ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "url": format!("{}/bucket/?list", self.base),
                "headers": {},
            })),
            Some("Get") => ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "url": format!("{}/bucket/{}", self.base, encode_key(&key)),
                "headers": {},
            })),
            Some("Put") => {
                let device = form.get("device").cloned().unwrap_or_default();
                let sha256 = form.get("sha256").cloned().unwrap_or_default();
                let created = format!("{device}/{key}#{sha256}");
                ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "url": format!("{}/bucket/{}", self.base, encode_key(&created)),
                    "headers": {},
                    "created-filename": created,
                }))
            }
            _ => ResponseTemplate::new(400),
        }
    }

    fn list(&self) -> ResponseTemplate {
        let objects = self.objects.lock().unwrap();
        let mut xml =
            String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?><ListBucketResult>");
        for key in objects.keys() {
            xml.push_str(&format!("<Contents><Key>{key}</Key></Contents>"));
        }
        xml.push_str("<IsTruncated>false</IsTruncated></ListBucketResult>");
        ResponseTemplate::new(200).set_body_string(xml)
    }

    fn get(&self, path: &str) -> ResponseTemplate {
        let key = decode_key(path.trim_start_matches("/bucket/"));
        match self.objects.lock().unwrap().get(&key) {
            Some(data) => ResponseTemplate::new(200).set_body_bytes(data.clone()),
            None => ResponseTemplate::new(404),
        }
    }

    fn put(&self, path: &str, body: &[u8]) -> ResponseTemplate {
        let key = decode_key(path.trim_start_matches("/bucket/"));
        self.objects.lock().unwrap().insert(key, body.to_vec());
        ResponseTemplate::new(200)
    }
}

impl Respond for BucketResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let path = request.url.path().to_string();
        match request.method.as_str() {
            "POST" if path == "/watchdemon/authenticate" => self.authenticate(request),
            "GET" if path == "/bucket/" && request.url.query() == Some("list") => self.list(),
            "GET" if path.starts_with("/bucket/") => self.get(&path),
            "PUT" if path.starts_with("/bucket/") => self.put(&path, &request.body),
            _ => ResponseTemplate::new(500),
        }
    }
}
