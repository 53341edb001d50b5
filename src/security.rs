#![forbid(unsafe_code)]

//! Process and request security helpers for the tubedrop server.

use anyhow::{Result, bail};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use nix::unistd::Uid;

use crate::config::AuthConfig;

/// Fails fast when the server is started as root. The download directory and
/// listening socket never need elevated privileges, and a root-owned artifact
/// tree is a recurring support headache.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

/// Username/password extracted from an `Authorization: Basic` header.
#[derive(Debug, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Decodes a basic-auth header value. Returns `None` for any other scheme or
/// malformed payload; the caller treats that the same as wrong credentials.
pub fn parse_basic_auth(header: &str) -> Option<Credentials> {
    let (scheme, encoded) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (username, password) = text.split_once(':')?;
    Some(Credentials {
        username: username.to_owned(),
        password: password.to_owned(),
    })
}

/// Plain equality against the configured expectations. Always false when auth
/// is enabled without credentials configured (the config loader rejects that
/// combination anyway).
pub fn credentials_match(auth: &AuthConfig, supplied: &Credentials) -> bool {
    !auth.username.is_empty()
        && auth.username == supplied.username
        && auth.password == supplied.password
}
