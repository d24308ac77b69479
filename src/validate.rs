use std::path::Path;

use serde::Deserialize;

use crate::error::ChatError;

/// Characters never allowed in usernames, passwords or room names.
const BANNED_SYMBOLS: &[char] = &[
    ' ', '\t', '\n', '\r', '"', '\'', '`', '<', '>', '|', '\\', '/', ':', ';', '*', '?', '[', ']',
    '{', '}', '(', ')', '&', '%', '$', '#', '@', '!', '~', '=', '+', ',', '.',
];

const MIN_CREDENTIAL_LEN: usize = 6;
const MAX_CREDENTIAL_LEN: usize = 64;
const MAX_ROOM_NAME_LEN: usize = 64;

/// On-disk shape of the banned words dictionary.
#[derive(Debug, Deserialize)]
struct BannedWords {
    banned_words: Vec<String>,
}

/// Username and password policy.
///
/// Room names, hosts and ports are checked by the free functions below since
/// they carry no configurable state.
#[derive(Debug, Default, Clone)]
pub struct Validator {
    banned_words: Vec<String>,
}

impl Validator {
    pub fn new(banned_words: impl IntoIterator<Item = String>) -> Self {
        Self {
            banned_words: banned_words
                .into_iter()
                .map(|w| w.to_lowercase())
                .filter(|w| !w.is_empty())
                .collect(),
        }
    }

    /// Load a `{"banned_words": [...]}` dictionary.
    pub fn from_json_file(path: &Path) -> Result<Self, ChatError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ChatError::Config(format!("{}: {e}", path.display())))?;
        let parsed: BannedWords = serde_json::from_str(&raw)
            .map_err(|e| ChatError::Config(format!("{}: {e}", path.display())))?;
        Ok(Self::new(parsed.banned_words))
    }

    pub fn username(&self, username: &str) -> bool {
        if !credential_shape(username) {
            return false;
        }
        let lower = username.to_lowercase();
        !self.banned_words.iter().any(|w| lower.contains(w.as_str()))
    }

    pub fn password(&self, password: &str) -> bool {
        credential_shape(password)
    }
}

fn credential_shape(s: &str) -> bool {
    let len = s.chars().count();
    (MIN_CREDENTIAL_LEN..=MAX_CREDENTIAL_LEN).contains(&len) && !s.contains(BANNED_SYMBOLS)
}

/// Room names are 1 to 64 characters with none of the banned symbols.
/// Anything else is allowed, including non-ASCII letters.
pub fn room_name(name: &str) -> bool {
    let len = name.chars().count();
    (1..=MAX_ROOM_NAME_LEN).contains(&len) && !name.contains(BANNED_SYMBOLS)
}

/// `localhost` or a dotted IPv4 quad.
pub fn host(host: &str) -> bool {
    if host == "localhost" {
        return true;
    }
    let octets: Vec<&str> = host.split('.').collect();
    octets.len() == 4
        && octets
            .iter()
            .all(|o| !o.is_empty() && o.len() <= 3 && o.parse::<u8>().is_ok())
}

/// Parse a user-supplied port; zero and anything outside `u16` are rejected.
pub fn port(raw: &str) -> Option<u16> {
    raw.trim().parse::<u16>().ok().filter(|&p| p != 0)
}

/// The address form rooms are bound to and handed out as.
pub fn canonical_host(host: &str) -> &str {
    if host == "localhost" { "127.0.0.1" } else { host }
}
