//! Consumers for what agents send back: command results and log streams.

use async_trait::async_trait;
use ferry_core::cmd::{CmdOut, LogLine, TtyLog, TtyOut};
use ferry_core::ports::{ConsumerHandle, Delivery, MessageBroker, MessageHandler};
use ferry_core::queues::QueueSpec;
use ferry_core::settings::QueueSettings;
use ferry_core::Result;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::dispatcher::CmdDispatcher;

const CHANNEL_CAPACITY: usize = 1024;

/// Routes callback frames into the dispatcher and fans logs and tty output
/// out to subscribers.
pub struct CallbackRouter {
    dispatcher: Arc<CmdDispatcher>,
    tty: broadcast::Sender<TtyOut>,
    shell_logs: broadcast::Sender<LogLine>,
    tty_logs: broadcast::Sender<TtyLog>,
}

impl CallbackRouter {
    pub fn new(dispatcher: Arc<CmdDispatcher>) -> Self {
        Self {
            dispatcher,
            tty: broadcast::channel(CHANNEL_CAPACITY).0,
            shell_logs: broadcast::channel(CHANNEL_CAPACITY).0,
            tty_logs: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn subscribe_tty(&self) -> broadcast::Receiver<TtyOut> {
        self.tty.subscribe()
    }

    pub fn subscribe_shell_logs(&self) -> broadcast::Receiver<LogLine> {
        self.shell_logs.subscribe()
    }

    pub fn subscribe_tty_logs(&self) -> broadcast::Receiver<TtyLog> {
        self.tty_logs.subscribe()
    }

    /// Declare the three agent-facing queues and start consuming them.
    pub async fn start(
        self: &Arc<Self>,
        broker: &dyn MessageBroker,
        queues: &QueueSettings,
    ) -> Result<Vec<ConsumerHandle>> {
        let routes: [(&str, Arc<dyn MessageHandler>); 3] = [
            (queues.callback.as_str(), Arc::new(CallbackHandler(self.clone()))),
            (queues.shell_log.as_str(), Arc::new(ShellLogHandler(self.clone()))),
            (queues.tty_log.as_str(), Arc::new(TtyLogHandler(self.clone()))),
        ];

        let mut handles = Vec::with_capacity(routes.len());
        for (queue, handler) in routes {
            broker.declare(&QueueSpec::new(queue)).await?;
            handles.push(broker.consume(queue, false, handler).await?);
            info!(queue, "Consuming agent queue");
        }
        Ok(handles)
    }

    async fn on_callback(&self, delivery: Delivery) -> bool {
        let out = match CmdOut::decode(&delivery.body) {
            Ok(out) => out,
            Err(e) => {
                warn!(queue = %delivery.queue, "Dropping callback: {}", e);
                return true;
            }
        };

        match out {
            CmdOut::Shell(out) => {
                let cmd_id = out.id;
                if self.dispatcher.on_shell_out(out).await {
                    return true;
                }
                // Another server may own the command; give up on redelivery.
                debug!(cmd_id = %cmd_id, redelivered = delivery.redelivered, "Result for unknown command");
                delivery.redelivered
            }
            CmdOut::Tty(out) => {
                let _ = self.tty.send(out);
                true
            }
        }
    }

    fn on_shell_log(&self, delivery: Delivery) -> bool {
        let parsed = std::str::from_utf8(&delivery.body)
            .map_err(|e| e.to_string())
            .and_then(|line| line.parse::<LogLine>().map_err(|e| e.to_string()));

        match parsed {
            Ok(line) => {
                let _ = self.shell_logs.send(line);
            }
            Err(e) => warn!(queue = %delivery.queue, "Dropping log line: {}", e),
        }
        true
    }

    fn on_tty_log(&self, delivery: Delivery) -> bool {
        match serde_json::from_slice::<TtyLog>(&delivery.body) {
            Ok(log) => {
                let _ = self.tty_logs.send(log);
            }
            Err(e) => warn!(queue = %delivery.queue, "Dropping tty log: {}", e),
        }
        true
    }
}

struct CallbackHandler(Arc<CallbackRouter>);

#[async_trait]
impl MessageHandler for CallbackHandler {
    async fn handle(&self, delivery: Delivery) -> bool {
        self.0.on_callback(delivery).await
    }
}

struct ShellLogHandler(Arc<CallbackRouter>);

#[async_trait]
impl MessageHandler for ShellLogHandler {
    async fn handle(&self, delivery: Delivery) -> bool {
        self.0.on_shell_log(delivery)
    }
}

struct TtyLogHandler(Arc<CallbackRouter>);

#[async_trait]
impl MessageHandler for TtyLogHandler {
    async fn handle(&self, delivery: Delivery) -> bool {
        self.0.on_tty_log(delivery)
    }
}
