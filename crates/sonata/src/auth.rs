//! Credential endpoints.
//!
//! `POST /login` and `POST /register` carry an urlencoded
//! `user=<name>&password=<pw>` body and always answer with a redirect. The
//! user table lives in memory and is written through to a [`UserStore`]
//! borrowed from the store pool for the duration of a registration.

use crate::error::SonataResult;
use crate::resource::{ResourcePool, UserStore};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{error, info, warn};

pub type StorePool = ResourcePool<Box<dyn UserStore>>;

pub const WELCOME_PAGE: &str = "/welcome.html";
pub const LOGIN_ERROR_PAGE: &str = "/logError.html";
pub const LOGIN_PAGE: &str = "/log.html";
pub const REGISTER_ERROR_PAGE: &str = "/registerError.html";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRoute {
    Login,
    Register,
}

impl AuthRoute {
    pub fn from_url(url: &str) -> Option<Self> {
        match url {
            "/login" => Some(AuthRoute::Login),
            "/register" => Some(AuthRoute::Register),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub name: String,
    pub password: String,
}

/// Decode `user=..&password=..`; field order does not matter.
pub fn parse_form(body: &[u8]) -> Option<Credentials> {
    let mut name = None;
    let mut password = None;
    for pair in body.split(|b| *b == b'&') {
        if pair.is_empty() {
            continue;
        }
        let mut kv = pair.splitn(2, |b| *b == b'=');
        let key = kv.next()?;
        let value = kv.next()?;
        match key {
            b"user" => name = Some(url_decode(value)?),
            b"password" => password = Some(url_decode(value)?),
            _ => {}
        }
    }
    let name = name.filter(|n| !n.is_empty())?;
    Some(Credentials {
        name,
        password: password?,
    })
}

fn url_decode(raw: &[u8]) -> Option<String> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        match raw[i] {
            b'+' => out.push(b' '),
            b'%' => {
                let hex = raw.get(i + 1..i + 3)?;
                if !hex.iter().all(u8::is_ascii_hexdigit) {
                    return None;
                }
                let hex = std::str::from_utf8(hex).ok()?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 2;
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8(out).ok()
}

/// In-memory credential table shared by every worker.
pub struct UserTable {
    users: RwLock<HashMap<String, String>>,
}

impl UserTable {
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
        }
    }

    /// Load every user through one pooled store handle.
    pub fn load(pool: &StorePool) -> SonataResult<Self> {
        let mut store = pool.acquire()?;
        let users: HashMap<_, _> = store.load_users()?.into_iter().collect();
        info!(users = users.len(), "user table loaded");
        Ok(Self {
            users: RwLock::new(users),
        })
    }

    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.read().is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.users.read().contains_key(name)
    }

    pub fn verify(&self, creds: &Credentials) -> bool {
        self.users
            .read()
            .get(&creds.name)
            .is_some_and(|pw| *pw == creds.password)
    }

    /// Insert a new user into the store and the table. `Ok(false)` if the
    /// name is taken.
    pub fn register(&self, store: &mut dyn UserStore, creds: &Credentials) -> SonataResult<bool> {
        let mut users = self.users.write();
        if users.contains_key(&creds.name) {
            return Ok(false);
        }
        store.insert_user(&creds.name, &creds.password)?;
        users.insert(creds.name.clone(), creds.password.clone());
        Ok(true)
    }
}

impl Default for UserTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Run a credential request and return the redirect target.
pub fn authenticate(route: AuthRoute, body: &[u8], users: &UserTable, pool: &StorePool) -> &'static str {
    let Some(creds) = parse_form(body) else {
        warn!(?route, "malformed credential form");
        return match route {
            AuthRoute::Login => LOGIN_ERROR_PAGE,
            AuthRoute::Register => REGISTER_ERROR_PAGE,
        };
    };

    match route {
        AuthRoute::Login => {
            if users.verify(&creds) {
                info!(user = %creds.name, "login succeeded");
                WELCOME_PAGE
            } else {
                info!(user = %creds.name, "login failed");
                LOGIN_ERROR_PAGE
            }
        }
        AuthRoute::Register => {
            if users.contains(&creds.name) {
                return REGISTER_ERROR_PAGE;
            }
            let mut store = match pool.acquire() {
                Ok(store) => store,
                Err(e) => {
                    error!(error = %e, "no store handle for registration");
                    return REGISTER_ERROR_PAGE;
                }
            };
            match users.register(&mut **store, &creds) {
                Ok(true) => {
                    info!(user = %creds.name, "user registered");
                    LOGIN_PAGE
                }
                Ok(false) => REGISTER_ERROR_PAGE,
                Err(e) => {
                    error!(user = %creds.name, error = %e, "registration failed");
                    REGISTER_ERROR_PAGE
                }
            }
        }
    }
}
