//! Worker-to-renderer progress reporting.
//!
//! The orchestrator runs on a worker thread and never touches the display
//! directly; it posts [`ProgressEvent`]s through a [`UiSink`]. The renderer
//! (one per host) is the only writer of display state.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub percent: Option<u8>,
}

pub trait UiSink: Send + Sync {
    fn log(&self, message: &str, percent: Option<u8>);
}

/// Sink that forwards events over a channel to the renderer thread.
pub struct ChannelSink {
    sender: Mutex<Sender<ProgressEvent>>,
}

impl ChannelSink {
    pub fn new() -> (Self, Receiver<ProgressEvent>) {
        let (sender, receiver) = mpsc::channel();
        (
            ChannelSink {
                sender: Mutex::new(sender),
            },
            receiver,
        )
    }
}

impl UiSink for ChannelSink {
    fn log(&self, message: &str, percent: Option<u8>) {
        if let Ok(sender) = self.sender.lock() {
            // A closed receiver only means the renderer is gone; the worker
            // keeps going.
            let _ = sender.send(ProgressEvent {
                message: message.to_owned(),
                percent,
            });
        }
    }
}

/// Sink for hosts and tests that do not render progress.
pub struct NullSink;

impl UiSink for NullSink {
    fn log(&self, _message: &str, _percent: Option<u8>) {}
}

/// Console renderer; drains the channel until every sink is dropped.
pub fn render_console(receiver: Receiver<ProgressEvent>) {
    for event in receiver {
        match event.percent {
            Some(percent) => println!("[{percent:>3}%] {}", event.message),
            None => println!("       {}", event.message),
        }
    }
}
