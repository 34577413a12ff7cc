//! Shared access to a running engine.
//!
//! The engine runs as a single task fed by a channel, so concurrent callers are
//! serialised and each command sees the effects of the ones before it.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use super::{Command, Engine, EngineError, Outcome};
use crate::model::Context;

/// A command on its way to the engine.
#[derive(Debug)]
pub struct Envelope {
    pub ctx: Context,
    pub command: Command,
    /// Where to send the result, if anyone is waiting for it.
    pub reply: Option<oneshot::Sender<Result<Outcome, EngineError>>>,
}

impl Envelope {
    /// An envelope nobody waits on.
    pub fn new(ctx: Context, command: Command) -> Self {
        Self {
            ctx,
            command,
            reply: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineHandle {
    sender: mpsc::Sender<Envelope>,
}

impl EngineHandle {
    /// Move `engine` onto its own task.
    ///
    /// The task ends once every handle is dropped and hands the engine back.
    pub fn spawn(mut engine: Engine, buffer: usize) -> (Self, JoinHandle<Engine>) {
        let (sender, receiver) = mpsc::channel(buffer);
        let task = tokio::spawn(async move {
            engine.run(ReceiverStream::new(receiver)).await;
            engine
        });
        (Self { sender }, task)
    }

    pub async fn execute(&self, ctx: Context, command: Command) -> Result<Outcome, EngineError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(Envelope {
                ctx,
                command,
                reply: Some(reply),
            })
            .await
            .map_err(|_| EngineError::Unavailable)?;
        response.await.map_err(|_| EngineError::Unavailable)?
    }
}
