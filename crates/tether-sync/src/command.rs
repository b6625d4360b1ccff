//! Host-authoritative command replication.
//!
//! Application commands implement [`Command`] and travel inside a
//! [`CommandEnvelope`] tagged with [`Command::TAG`]. Clients only ever submit
//! commands to the host. The host validates (and may transform) each one, then
//! re-emits it as a `CommandBroadcast` that every peer, the submitter
//! included, applies. Nothing reaches a simulation without passing through
//! the host.
//!
//! Request commands ([`Command::IS_REQUEST`]) ask the host to decide
//! something. Only the host runs request handlers; their decisions come back
//! as ordinary commands.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tether_net::{DecodeError, EncodeError, Message, MessageKind, Outbox, PeerId, SessionContext};

/// An application command that can be replicated.
pub trait Command: Serialize + DeserializeOwned + 'static {
    /// Stable tag identifying the command type on the wire.
    const TAG: &'static str;
    /// Only the host may act on this command.
    const IS_REQUEST: bool = false;
}

/// Wire form of a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// [`Command::TAG`] of the body.
    pub tag: String,
    /// The body is a host-only request.
    #[serde(default)]
    pub request: bool,
    /// Peer that submitted the command.
    pub origin: PeerId,
    /// The command itself.
    pub body: serde_json::Value,
}

impl CommandEnvelope {
    /// Wrap `command` as submitted by `origin`.
    pub fn new<C: Command>(command: &C, origin: PeerId) -> Result<Self, CommandError> {
        Ok(Self {
            tag: C::TAG.to_string(),
            request: C::IS_REQUEST,
            origin,
            body: serde_json::to_value(command).map_err(CommandError::Body)?,
        })
    }

    /// Decode the body as `C`.
    pub fn decode<C: Command>(&self) -> Result<C, CommandError> {
        serde_json::from_value(self.body.clone()).map_err(CommandError::Body)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

type Handler = Box<dyn FnMut(&CommandEnvelope) -> Result<(), CommandError> + Send>;
type Validator =
    Box<dyn FnMut(&CommandEnvelope) -> Result<Result<CommandEnvelope, String>, CommandError> + Send>;
type RequestHandler =
    Box<dyn FnMut(&CommandEnvelope, &mut IssuedCommands) -> Result<(), CommandError> + Send>;

/// Commands a request handler decided to issue.
#[derive(Debug, Default)]
pub struct IssuedCommands {
    origin: PeerId,
    commands: Vec<CommandEnvelope>,
}

impl IssuedCommands {
    /// Issue `command` on behalf of the request's origin.
    pub fn issue<C: Command>(&mut self, command: &C) -> Result<(), CommandError> {
        self.commands.push(CommandEnvelope::new(command, self.origin)?);
        Ok(())
    }

    /// Number of commands issued.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Returns `true` if nothing was issued.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Per-tag command handlers, host validators, and request handlers.
#[derive(Default)]
pub struct CommandRegistry {
    handlers: HashMap<String, Handler>,
    validators: HashMap<String, Validator>,
    requests: HashMap<String, RequestHandler>,
}

impl CommandRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `C` commands with `handler(command, origin)`.
    pub fn register<C: Command>(&mut self, mut handler: impl FnMut(C, PeerId) + Send + 'static) {
        self.handlers.insert(
            C::TAG.to_string(),
            Box::new(move |env: &CommandEnvelope| {
                handler(env.decode()?, env.origin);
                Ok(())
            }),
        );
    }

    /// On the host, check or rewrite `C` commands before they are broadcast.
    /// `Err(reason)` rejects the command.
    pub fn validate_with<C: Command>(
        &mut self,
        mut validator: impl FnMut(C, PeerId) -> Result<C, String> + Send + 'static,
    ) {
        self.validators.insert(
            C::TAG.to_string(),
            Box::new(move |env: &CommandEnvelope| {
                let command: C = env.decode()?;
                Ok(match validator(command, env.origin) {
                    Ok(accepted) => Ok(CommandEnvelope::new(&accepted, env.origin)?),
                    Err(reason) => Err(reason),
                })
            }),
        );
    }

    /// On the host, decide `R` requests by issuing ordinary commands.
    pub fn register_request<R: Command>(
        &mut self,
        mut handler: impl FnMut(R, PeerId, &mut IssuedCommands) -> Result<(), CommandError>
        + Send
        + 'static,
    ) {
        self.requests.insert(
            R::TAG.to_string(),
            Box::new(move |env: &CommandEnvelope, issued: &mut IssuedCommands| {
                handler(env.decode()?, env.origin, issued)
            }),
        );
    }

    /// Returns `true` if a handler is registered for `tag`.
    pub fn has_handler(&self, tag: &str) -> bool {
        self.handlers.contains_key(tag)
    }

    /// Invoke the handler for `env.tag`. Returns `false` for an unknown tag.
    pub fn dispatch(&mut self, env: &CommandEnvelope) -> Result<bool, CommandError> {
        let Some(handler) = self.handlers.get_mut(&env.tag) else {
            tracing::warn!(tag = %env.tag, origin = env.origin, "no handler for command, dropping");
            return Ok(false);
        };
        handler(env)?;
        Ok(true)
    }
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("validators", &self.validators.keys().collect::<Vec<_>>())
            .field("requests", &self.requests.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// What happened to a submitted or received command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Forwarded to the host for authorization.
    Submitted,
    /// Authorized, broadcast, and applied locally (host) or applied from a
    /// host broadcast (client). Carries the number of commands applied.
    Applied(usize),
    /// The host's validator refused the command.
    Rejected {
        /// Command tag.
        tag: String,
        /// Submitting peer.
        origin: PeerId,
        /// Validator's reason.
        reason: String,
    },
    /// No handler is registered for the tag.
    UnknownTag(String),
    /// Dropped as an authority violation.
    Ignored,
}

/// Sends, authorizes, and dispatches commands.
#[derive(Debug, Default)]
pub struct CommandChannel {
    registry: CommandRegistry,
}

impl CommandChannel {
    /// Channel dispatching through `registry`.
    pub fn new(registry: CommandRegistry) -> Self {
        Self { registry }
    }

    /// Handler registry.
    pub fn registry_mut(&mut self) -> &mut CommandRegistry {
        &mut self.registry
    }

    /// Submit a local command.
    ///
    /// A client forwards it to the host and applies nothing. The host
    /// authorizes it immediately, as if received from itself.
    pub fn send_command<C: Command>(
        &mut self,
        ctx: &SessionContext,
        command: &C,
        tick: i64,
        outbox: &mut Outbox,
    ) -> Result<CommandOutcome, CommandError> {
        let env = CommandEnvelope::new(command, ctx.local_id)?;
        if ctx.is_host() {
            return self.authorize(ctx, env, tick, outbox);
        }
        outbox.send_to(
            ctx.host_id,
            Message::with_payload(MessageKind::Command, ctx.local_id, tick, &env)?,
        );
        tracing::trace!(tag = C::TAG, "command submitted to host");
        Ok(CommandOutcome::Submitted)
    }

    /// Handle a received `Command` or `CommandBroadcast` from `peer`.
    pub fn handle_message(
        &mut self,
        ctx: &SessionContext,
        peer: PeerId,
        message: &Message,
        outbox: &mut Outbox,
    ) -> Result<CommandOutcome, CommandError> {
        match message.kind {
            MessageKind::Command => {
                let mut env: CommandEnvelope = message.payload_as()?;
                if !ctx.is_host() {
                    tracing::warn!(peer, tag = %env.tag, "command submitted to a non-host peer, ignoring");
                    return Ok(CommandOutcome::Ignored);
                }
                env.origin = peer;
                self.authorize(ctx, env, message.tick, outbox)
            }
            MessageKind::CommandBroadcast => {
                let env: CommandEnvelope = message.payload_as()?;
                if ctx.is_host() || !ctx.is_from_host(peer) {
                    tracing::warn!(
                        peer,
                        tag = %env.tag,
                        "command broadcast from a non-authoritative peer, ignoring"
                    );
                    return Ok(CommandOutcome::Ignored);
                }
                if env.request {
                    tracing::warn!(
                        peer,
                        tag = %env.tag,
                        "protocol violation: host-only request reached a client, ignoring"
                    );
                    return Ok(CommandOutcome::Ignored);
                }
                Ok(match self.registry.dispatch(&env)? {
                    true => CommandOutcome::Applied(1),
                    false => CommandOutcome::UnknownTag(env.tag),
                })
            }
            other => {
                tracing::debug!(?other, "not a command message");
                Ok(CommandOutcome::Ignored)
            }
        }
    }

    fn authorize(
        &mut self,
        ctx: &SessionContext,
        env: CommandEnvelope,
        tick: i64,
        outbox: &mut Outbox,
    ) -> Result<CommandOutcome, CommandError> {
        if env.request {
            let Some(handler) = self.registry.requests.get_mut(&env.tag) else {
                tracing::warn!(tag = %env.tag, origin = env.origin, "no request handler, dropping");
                return Ok(CommandOutcome::UnknownTag(env.tag));
            };
            let mut issued = IssuedCommands {
                origin: env.origin,
                commands: Vec::new(),
            };
            handler(&env, &mut issued)?;
            let mut applied = 0;
            for command in issued.commands {
                if self.broadcast_and_apply(ctx, &command, tick, outbox)? {
                    applied += 1;
                }
            }
            tracing::debug!(tag = %env.tag, origin = env.origin, applied, "request decided");
            return Ok(CommandOutcome::Applied(applied));
        }

        if !self.registry.has_handler(&env.tag) && !self.registry.validators.contains_key(&env.tag) {
            tracing::warn!(tag = %env.tag, origin = env.origin, "unknown command tag, dropping");
            return Ok(CommandOutcome::UnknownTag(env.tag));
        }

        let env = match self.registry.validators.get_mut(&env.tag) {
            Some(validator) => match validator(&env)? {
                Ok(accepted) => accepted,
                Err(reason) => {
                    tracing::info!(tag = %env.tag, origin = env.origin, %reason, "command rejected");
                    return Ok(CommandOutcome::Rejected {
                        tag: env.tag,
                        origin: env.origin,
                        reason,
                    });
                }
            },
            None => env,
        };

        let applied = self.broadcast_and_apply(ctx, &env, tick, outbox)?;
        Ok(CommandOutcome::Applied(usize::from(applied)))
    }

    fn broadcast_and_apply(
        &mut self,
        ctx: &SessionContext,
        env: &CommandEnvelope,
        tick: i64,
        outbox: &mut Outbox,
    ) -> Result<bool, CommandError> {
        outbox.send_to_all(Message::with_payload(
            MessageKind::CommandBroadcast,
            ctx.local_id,
            tick,
            env,
        )?);
        self.registry.dispatch(env)
    }
}

/// Errors encoding, decoding, or handling a command.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The message payload was malformed.
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// The outgoing message could not be encoded.
    #[error(transparent)]
    Encode(#[from] EncodeError),
    /// The command body did not match the registered type.
    #[error("command body mismatch: {0}")]
    Body(#[source] serde_json::Error),
}

#[cfg(test)]
#[path = "command_tests.rs"]
mod tests;
