// Router task: sole owner of a dispatcher
use arbor_core::{Dispatcher, LinkEvent, LinkId, Node};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::{BridgeError, Result};

const COMMAND_BUFFER: usize = 1024;

type Job = Box<dyn FnOnce(&mut Dispatcher) + Send>;

enum Command {
    Call(Job),
    Deliver(LinkId, LinkEvent),
    Shutdown(oneshot::Sender<Option<Node>>),
}

pub struct Router;

impl Router {
    /// Moves `dispatcher` onto a new task and returns the handle used to reach it.
    pub fn spawn(dispatcher: Dispatcher) -> (RouterHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let task = tokio::spawn(run(dispatcher, rx));
        (RouterHandle { tx }, task)
    }
}

async fn run(mut dispatcher: Dispatcher, mut rx: mpsc::Receiver<Command>) {
    info!("Router started");
    while let Some(command) = rx.recv().await {
        match command {
            Command::Call(job) => job(&mut dispatcher),
            Command::Deliver(link, event) => {
                if let Err(e) = dispatcher.deliver(link, event) {
                    debug!(link = %link, error = %e, "Link event not delivered");
                }
            }
            Command::Shutdown(reply) => {
                let _ = reply.send(dispatcher.remove_root());
                break;
            }
        }
    }
    info!("Router stopped");
}

#[derive(Clone)]
pub struct RouterHandle {
    tx: mpsc::Sender<Command>,
}

impl RouterHandle {
    /// Runs `f` on the router task and returns its result.
    ///
    /// Must not be awaited from inside a listener: the router would wait on itself.
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Dispatcher) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move |dispatcher| {
            let _ = reply_tx.send(f(dispatcher));
        });
        self.tx
            .send(Command::Call(job))
            .await
            .map_err(|_| BridgeError::RouterGone)?;
        reply_rx.await.map_err(|_| BridgeError::RouterGone)
    }

    /// Queues an inbound transport occurrence for `link`.
    pub async fn deliver(&self, link: LinkId, event: LinkEvent) -> Result<()> {
        self.tx
            .send(Command::Deliver(link, event))
            .await
            .map_err(|_| BridgeError::RouterGone)
    }

    /// Detaches the root and stops the task, returning the detached tree.
    pub async fn shutdown(&self) -> Result<Option<Node>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Shutdown(reply_tx))
            .await
            .map_err(|_| BridgeError::RouterGone)?;
        reply_rx.await.map_err(|_| BridgeError::RouterGone)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
