//! Host navigation seam
//!
//! The engine never talks to a browser directly. Whatever embeds it (a
//! webview bridge, a test, the headless CLI) implements [`Host`] to expose the
//! current location and the navigation history stack.

use std::sync::{Mutex, MutexGuard};

use url::Url;

/// Location and history hooks of the embedding environment.
pub trait Host: Send + Sync {
    /// Current page URL.
    fn location(&self) -> Url;

    /// Push a new history entry and make it current.
    fn push_state(&self, url: &Url);

    /// Replace the current history entry.
    fn replace_state(&self, url: &Url);
}

/// In-memory history stack for headless sessions.
#[derive(Debug)]
pub struct MemoryHost {
    history: Mutex<History>,
}

#[derive(Debug)]
struct History {
    current: Url,
    previous: Vec<Url>,
}

impl MemoryHost {
    pub fn new(start: Url) -> Self {
        Self {
            history: Mutex::new(History {
                current: start,
                previous: Vec::new(),
            }),
        }
    }

    /// All entries, oldest first.
    pub fn history(&self) -> Vec<Url> {
        let history = self.entries();
        let mut entries = history.previous.clone();
        entries.push(history.current.clone());
        entries
    }

    /// Step back one entry, returning the new location. The first entry is
    /// never popped.
    pub fn back(&self) -> Option<Url> {
        let mut history = self.entries();
        let previous = history.previous.pop()?;
        history.current = previous;
        Some(history.current.clone())
    }

    fn entries(&self) -> MutexGuard<'_, History> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Host for MemoryHost {
    fn location(&self) -> Url {
        self.entries().current.clone()
    }

    fn push_state(&self, url: &Url) {
        let mut history = self.entries();
        let previous = std::mem::replace(&mut history.current, url.clone());
        history.previous.push(previous);
    }

    fn replace_state(&self, url: &Url) {
        self.entries().current = url.clone();
    }
}
