use std::future::Future;
use std::pin::Pin;

use crate::error::ChatError;

/// The future a command handler returns.
///
/// Handlers are async, and async fns return anonymous future types that
/// can't be stored in a table. Boxing erases the type; `Send` lets the
/// future run inside a spawned connection task.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ChatError>> + Send + 'a>>;

/// A command handler: owning server `C`, invoking session `S`, and the
/// argument remainder after the token.
pub type Handler<C, S> = for<'a> fn(&'a C, &'a mut S, &'a str) -> HandlerFuture<'a>;

/// Outcome of a dispatch that didn't fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Handled,
    UnknownCommand,
}

/// Token → handler table, built once when a server is constructed.
///
/// Lookup is separate from argument shaping: each handler receives the raw
/// remainder and splits it however its own arity needs.
pub struct CommandRegistry<C, S> {
    commands: Vec<(&'static str, Handler<C, S>)>,
}

impl<C, S> Default for CommandRegistry<C, S> {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
        }
    }
}

impl<C, S> CommandRegistry<C, S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, token: &'static str, handler: Handler<C, S>) -> Result<(), ChatError> {
        if !token.starts_with('/') || token.len() < 2 || token.contains(char::is_whitespace) {
            return Err(ChatError::InvalidCommand(token.to_string()));
        }
        if self.contains(token) {
            return Err(ChatError::DuplicateCommand(token.to_string()));
        }
        self.commands.push((token, handler));
        Ok(())
    }

    /// Builder form of `register`.
    pub fn with(mut self, token: &'static str, handler: Handler<C, S>) -> Result<Self, ChatError> {
        self.register(token, handler)?;
        Ok(self)
    }

    pub fn contains(&self, token: &str) -> bool {
        self.commands.iter().any(|(t, _)| *t == token)
    }

    /// Registered tokens in registration order.
    pub fn tokens(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.commands.iter().map(|(t, _)| *t)
    }

    /// Run the handler registered for `token`.
    ///
    /// An unregistered token is not an error: the caller decides what an
    /// unknown command means (a chat line in a room, a complaint in the
    /// lobby).
    pub async fn dispatch(
        &self,
        ctx: &C,
        session: &mut S,
        token: &str,
        args: &str,
    ) -> Result<Dispatch, ChatError> {
        let Some((_, handler)) = self.commands.iter().find(|(t, _)| *t == token) else {
            return Ok(Dispatch::UnknownCommand);
        };
        handler(ctx, session, args).await?;
        Ok(Dispatch::Handled)
    }
}
