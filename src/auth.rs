use tracing::{debug, info};

use crate::error::ChatError;
use crate::session::{Authenticated, Session, Unauthenticated};
use crate::store::{Store, StoreError};
use crate::validate::Validator;

pub const USERNAME_PROMPT: &str = "Enter username: ";
pub const USERNAME_INVALID: &str = "Invalid username,\ntry another username: ";
pub const REGISTER_PROMPT: &str = "You are new here,\nchoose a password: ";
pub const PASSWORD_WEAK: &str = "Password is too weak or contains forbidden characters,\ntry again: ";
pub const PASSWORD_PROMPT: &str = "Enter password: ";
pub const PASSWORD_WRONG: &str = "Wrong password,\ntry again: ";
pub const USERNAME_RACED: &str = "This username was registered a moment ago, reconnect to log in";

/// Run the credential exchange on a fresh room connection.
///
/// Unknown usernames register, known ones log in. `Ok(None)` means the peer
/// cancelled (empty password at login) or lost a registration race; nothing
/// has been persisted for it. A peer close during any prompt surfaces as
/// `Disconnected`.
pub async fn authenticate(
    mut session: Session<Unauthenticated>,
    store: &dyn Store,
    validator: &Validator,
) -> Result<Option<Session<Authenticated>>, ChatError> {
    let mut username = session.prompt(USERNAME_PROMPT).await?;
    while !validator.username(&username) {
        username = session.prompt(USERNAME_INVALID).await?;
    }

    let accepted = match store.get_password(&username).await? {
        None => register(&mut session, store, validator, &username).await?,
        Some(stored) => login(&mut session, &username, &stored).await?,
    };

    Ok(accepted.then(|| session.authenticated(username)))
}

async fn register(
    session: &mut Session<Unauthenticated>,
    store: &dyn Store,
    validator: &Validator,
    username: &str,
) -> Result<bool, ChatError> {
    debug!(session = %session.id(), username, "registering");
    let mut password = session.prompt(REGISTER_PROMPT).await?;
    while !validator.password(&password) {
        password = session.prompt(PASSWORD_WEAK).await?;
    }

    match store.put_user(username, &password).await {
        Ok(()) => {
            info!(session = %session.id(), username, "registered new user");
            Ok(true)
        }
        Err(StoreError::UserExists(_)) => {
            session.send(USERNAME_RACED).await?;
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

async fn login(
    session: &mut Session<Unauthenticated>,
    username: &str,
    stored: &str,
) -> Result<bool, ChatError> {
    debug!(session = %session.id(), username, "logging in");
    let mut password = session.prompt(PASSWORD_PROMPT).await?;
    loop {
        if password.is_empty() {
            debug!(session = %session.id(), username, "login cancelled");
            return Ok(false);
        }
        if password == stored {
            return Ok(true);
        }
        password = session.prompt(PASSWORD_WRONG).await?;
    }
}
