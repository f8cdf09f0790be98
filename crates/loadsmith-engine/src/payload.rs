//! Request decoration for the write path.
//!
//! The engine only needs two things from a payload source: a set of request
//! headers and a JSON body for a given endpoint. [`SyntheticPayloads`] is a
//! small table-driven source good enough to exercise a JSON API; callers with
//! richer data plug in their own [`PayloadProvider`].

use rand::seq::SliceRandom;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashMap;

pub trait PayloadProvider: Send + Sync {
    fn random_headers(&self) -> HashMap<String, String>;
    fn payload_for(&self, endpoint: &str) -> Value;
}

/// Body shape generated for an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Register,
    Login,
    Password,
    Note,
    Backup,
    /// Unknown endpoint: an explicit `{}` body.
    Empty,
}

impl PayloadKind {
    fn for_path(endpoint: &str) -> Self {
        let path = endpoint.split('?').next().unwrap_or(endpoint);
        if path.ends_with("/register") {
            PayloadKind::Register
        } else if path.ends_with("/login") || path.ends_with("/cloud-login") {
            PayloadKind::Login
        } else if path.contains("/passwords") {
            PayloadKind::Password
        } else if path.contains("/notes") {
            PayloadKind::Note
        } else if path.contains("/backup") {
            PayloadKind::Backup
        } else {
            PayloadKind::Empty
        }
    }
}

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_2) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
    "curl/8.4.0",
];
const LANGUAGES: &[&str] = &["en-US,en;q=0.9", "ru-RU,ru;q=0.9,en;q=0.8", "de-DE,de;q=0.7"];
const USERNAMES: &[&str] = &["test_user", "admin", "user123", "demo_user", "load_test"];
const WEBSITES: &[&str] = &["github.com", "example.com", "stackoverflow.com", "reddit.com"];
const NOTE_TITLES: &[&str] = &["Meeting Notes", "TODO List", "Ideas", "Work Notes"];

/// Payload source backed by an endpoint → [`PayloadKind`] table fixed at construction.
#[derive(Debug, Clone, Default)]
pub struct SyntheticPayloads {
    table: HashMap<String, PayloadKind>,
}

impl SyntheticPayloads {
    pub fn new<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let table = endpoints
            .into_iter()
            .map(|e| {
                let e = e.as_ref();
                (e.to_string(), PayloadKind::for_path(e))
            })
            .collect();
        Self { table }
    }

    pub fn kind_of(&self, endpoint: &str) -> PayloadKind {
        self.table
            .get(endpoint)
            .copied()
            .unwrap_or(PayloadKind::Empty)
    }
}

fn pick<'a>(rng: &mut impl Rng, items: &[&'a str]) -> &'a str {
    items.choose(rng).copied().unwrap_or_default()
}

fn token(rng: &mut impl Rng, len: usize) -> String {
    (0..len)
        .map(|_| char::from(rng.sample(Alphanumeric)))
        .collect()
}

impl PayloadProvider for SyntheticPayloads {
    fn random_headers(&self) -> HashMap<String, String> {
        let mut rng = rand::thread_rng();
        let mut headers = HashMap::new();
        headers.insert("User-Agent".to_string(), pick(&mut rng, USER_AGENTS).to_string());
        headers.insert("Accept".to_string(), "application/json, text/plain, */*".to_string());
        headers.insert(
            "Accept-Language".to_string(),
            pick(&mut rng, LANGUAGES).to_string(),
        );
        headers.insert("Cache-Control".to_string(), "no-cache".to_string());
        headers.insert("X-Request-Id".to_string(), token(&mut rng, 16));
        headers
    }

    fn payload_for(&self, endpoint: &str) -> Value {
        let mut rng = rand::thread_rng();
        match self.kind_of(endpoint) {
            PayloadKind::Register => json!({
                "username": format!("{}_{}", pick(&mut rng, USERNAMES), rng.gen_range(1000..10000)),
                "salt": token(&mut rng, 16),
                "passwordHash": format!("$argon2id$v=19$m=4096,t=3,p=1${}", token(&mut rng, 32)),
            }),
            PayloadKind::Login => json!({
                "username": pick(&mut rng, USERNAMES),
                "passwordHash": token(&mut rng, 32),
            }),
            PayloadKind::Password => json!({
                "site": pick(&mut rng, WEBSITES),
                "login": pick(&mut rng, USERNAMES),
                "encryptedPassword": token(&mut rng, 44),
            }),
            PayloadKind::Note => {
                let len = rng.gen_range(32..256);
                json!({
                    "title": pick(&mut rng, NOTE_TITLES),
                    "encryptedContent": token(&mut rng, len),
                })
            }
            PayloadKind::Backup => json!({
                "version": 1,
                "passwords": [],
                "notes": [],
                "checksum": token(&mut rng, 64),
            }),
            PayloadKind::Empty => json!({}),
        }
    }
}
