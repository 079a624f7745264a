//! Contains the events and functionality to monitor the commands and responses that a client
//! sends and receives from the server.

use std::{sync::Arc, time::Duration};

use bson::Document;
use derive_where::derive_where;

use crate::{error::Error, options::ServerAddress};

/// An event that triggers when a database command is initiated.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct CommandStartedEvent {
    /// The command being run.
    pub command: Document,

    /// The name of the database the command is being run against.
    pub db: String,

    /// The type of command being run, e.g. "find" or "hello".
    pub command_name: String,

    /// The driver-generated identifier for the request.
    pub request_id: i32,

    /// The address of the server the command was run on.
    pub connection: ConnectionInfo,
}

/// An event that triggers when a database command completes without an error.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct CommandSucceededEvent {
    /// The total execution time of the command (including the network round-trip).
    pub duration: Duration,

    /// The server's reply to the command.
    pub reply: Document,

    /// The type of command that was run, e.g. "find" or "hello".
    pub command_name: String,

    /// The driver-generated identifier for the request.
    pub request_id: i32,

    /// The address of the server the command was run on.
    pub connection: ConnectionInfo,
}

/// An event that triggers when a command failed to complete successfully.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct CommandFailedEvent {
    /// The total execution time of the command (including the network round-trip).
    pub duration: Duration,

    /// The type of command that was run, e.g. "find" or "hello".
    pub command_name: String,

    /// The error that the driver returned due to the event failing.
    pub failure: Error,

    /// The driver-generated identifier for the request.
    pub request_id: i32,

    /// The address of the server the command was run on.
    pub connection: ConnectionInfo,
}

/// User-facing information about a connection to the database.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionInfo {
    /// A driver-generated identifier that uniquely identifies the connection.
    pub id: u32,

    /// The address that the connection is connected to.
    pub address: ServerAddress,
}

/// The set of events emitted around command execution.
#[derive(Clone, Debug, derive_more::From)]
#[allow(missing_docs)]
#[non_exhaustive]
pub enum CommandEvent {
    Started(CommandStartedEvent),
    Succeeded(CommandSucceededEvent),
    Failed(CommandFailedEvent),
}

/// Applications can implement this trait to specify custom logic to run on each command event
/// sent by the driver. Handlers must not block; emission happens inline on driver tasks.
#[allow(unused_variables)]
pub trait CommandEventHandler: Send + Sync {
    /// Called whenever a database command is initiated.
    fn handle_command_started_event(&self, event: CommandStartedEvent) {}

    /// Called whenever a database command successfully completes.
    fn handle_command_succeeded_event(&self, event: CommandSucceededEvent) {}

    /// Called whenever a database command fails to complete successfully.
    fn handle_command_failed_event(&self, event: CommandFailedEvent) {}
}

/// Emitter that fans a [`CommandEvent`] out to the frozen list of registered handlers.
#[derive(Clone)]
#[derive_where(Debug)]
pub(crate) struct CommandEventEmitter {
    #[derive_where(skip)]
    listeners: Arc<[Arc<dyn CommandEventHandler>]>,
}

impl CommandEventEmitter {
    pub(crate) fn new(listeners: Vec<Arc<dyn CommandEventHandler>>) -> Self {
        Self {
            listeners: listeners.into(),
        }
    }

    /// Emit the event produced by `generate_event` to each registered listener. The closure is
    /// not invoked when nobody is listening.
    pub(crate) fn emit_event(&self, generate_event: impl FnOnce() -> CommandEvent) {
        if self.listeners.is_empty() {
            return;
        }
        super::deliver(&self.listeners, generate_event(), |listener, event| {
            match event {
                CommandEvent::Started(e) => listener.handle_command_started_event(e),
                CommandEvent::Succeeded(e) => listener.handle_command_succeeded_event(e),
                CommandEvent::Failed(e) => listener.handle_command_failed_event(e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    struct Panicking;

    impl CommandEventHandler for Panicking {
        fn handle_command_started_event(&self, _event: CommandStartedEvent) {
            panic!("listener failure");
        }
    }

    struct Counting(Arc<AtomicUsize>);

    impl CommandEventHandler for Counting {
        fn handle_command_started_event(&self, _event: CommandStartedEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn listener_panic_does_not_stop_fanout() {
        let count = Arc::new(AtomicUsize::new(0));
        let emitter = CommandEventEmitter::new(vec![
            Arc::new(Panicking),
            Arc::new(Counting(count.clone())),
        ]);

        emitter.emit_event(|| {
            CommandEvent::Started(CommandStartedEvent {
                command: bson::doc! { "ping": 1 },
                db: "admin".to_string(),
                command_name: "ping".to_string(),
                request_id: 1,
                connection: ConnectionInfo {
                    id: 1,
                    address: Default::default(),
                },
            })
        });

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
