//! Per-run command channel into a server's stdin.
//!
//! A fresh channel is created for every run, so a command queued while the
//! previous process was shutting down can never reach the next one.

use tokio::sync::mpsc;

pub fn channel() -> (CommandSender, CommandReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CommandSender(tx), CommandReceiver(rx))
}

#[derive(Debug, Clone)]
pub struct CommandSender(mpsc::UnboundedSender<String>);

impl CommandSender {
    /// Queue a command. Returns false once the receiving run has ended.
    pub fn send(&self, command: impl Into<String>) -> bool {
        self.0.send(command.into()).is_ok()
    }
}

#[derive(Debug)]
pub struct CommandReceiver(mpsc::UnboundedReceiver<String>);

impl CommandReceiver {
    pub async fn recv(&mut self) -> Option<String> {
        self.0.recv().await
    }

    pub fn try_recv(&mut self) -> Option<String> {
        self.0.try_recv().ok()
    }
}
