use crate::message::{Message, MessageKind};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::error;

/// Callback invoked for every inbound message of its category.
pub type Handler = Arc<dyn Fn(&Message) + Send + Sync>;

/// Identity of a registered handler, used to unregister it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Inbound categories an endpoint dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    /// Requests and notifications
    Message,
    Response,
    Command,
}

impl Category {
    pub fn of(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Request | MessageKind::Notification => Category::Message,
            MessageKind::Response => Category::Response,
            MessageKind::Command => Category::Command,
        }
    }
}

/// Handlers for one listener registration; any category may be left empty.
#[derive(Default, Clone)]
pub struct Handlers {
    pub on_message: Option<Handler>,
    pub on_response: Option<Handler>,
    pub on_command: Option<Handler>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_message<F>(mut self, f: F) -> Self
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.on_message = Some(Arc::new(f));
        self
    }

    pub fn on_response<F>(mut self, f: F) -> Self
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.on_response = Some(Arc::new(f));
        self
    }

    pub fn on_command<F>(mut self, f: F) -> Self
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.on_command = Some(Arc::new(f));
        self
    }

    /// The same handler for every category
    pub fn all(handler: Handler) -> Self {
        Self {
            on_message: Some(handler.clone()),
            on_response: Some(handler.clone()),
            on_command: Some(handler),
        }
    }

    pub(crate) fn into_entries(self) -> Vec<(Category, Handler)> {
        [
            (Category::Message, self.on_message),
            (Category::Response, self.on_response),
            (Category::Command, self.on_command),
        ]
        .into_iter()
        .filter_map(|(category, handler)| handler.map(|h| (category, h)))
        .collect()
    }
}

type Entries = RwLock<Vec<(HandlerId, Handler)>>;

/// Per-endpoint handler lists, invoked in registration order.
#[derive(Default)]
pub struct HandlerTable {
    message: Entries,
    response: Entries,
    command: Entries,
    next_id: AtomicU64,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self, category: Category) -> &Entries {
        match category {
            Category::Message => &self.message,
            Category::Response => &self.response,
            Category::Command => &self.command,
        }
    }

    pub fn add(&self, category: Category, handler: Handler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries(category)
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, handler));
        id
    }

    /// Removes the handler with this id from whichever category holds it.
    pub fn remove(&self, id: HandlerId) -> bool {
        for category in [Category::Message, Category::Response, Category::Command] {
            let mut entries = self
                .entries(category)
                .write()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(pos) = entries.iter().position(|(existing, _)| *existing == id) {
                entries.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn len(&self, category: Category) -> usize {
        self.entries(category)
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn total(&self) -> usize {
        self.len(Category::Message) + self.len(Category::Response) + self.len(Category::Command)
    }

    /// Invokes every handler of the message's category and returns how many ran.
    /// The list is snapshotted first so handlers may unregister themselves.
    pub fn dispatch(&self, message: &Message) -> usize {
        let snapshot: Vec<Handler> = self
            .entries(Category::of(message.kind))
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, h)| h.clone())
            .collect();

        for handler in &snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
                error!(
                    to = %message.to,
                    body = %message.body,
                    "Message handler panicked"
                );
            }
        }
        snapshot.len()
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable")
            .field("message", &self.len(Category::Message))
            .field("response", &self.len(Category::Response))
            .field("command", &self.len(Category::Command))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> Handler {
        let log = log.clone();
        Arc::new(move |m: &Message| log.lock().unwrap().push(format!("{tag}:{}", m.body)))
    }

    #[test]
    fn test_dispatch_routes_by_kind() {
        let table = HandlerTable::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        table.add(Category::Message, recorder(&log, "msg"));
        table.add(Category::Response, recorder(&log, "resp"));
        table.add(Category::Command, recorder(&log, "cmd"));

        table.dispatch(&Message::request("e", "x", "r"));
        table.dispatch(&Message::notification("e", "x", "n"));
        table.dispatch(&Message::reply_to(&Message::request("x", "e", "q"), "a"));
        table.dispatch(&Message::command("e", "x", "c"));

        assert_eq!(
            *log.lock().unwrap(),
            vec!["msg:r", "msg:n", "resp:a", "cmd:c"]
        );
    }

    #[test]
    fn test_handlers_are_additive_and_ordered() {
        let table = HandlerTable::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        table.add(Category::Message, recorder(&log, "first"));
        table.add(Category::Message, recorder(&log, "second"));

        assert_eq!(table.dispatch(&Message::notification("e", "x", "hi")), 2);
        assert_eq!(*log.lock().unwrap(), vec!["first:hi", "second:hi"]);
    }

    #[test]
    fn test_remove_by_identity() {
        let table = HandlerTable::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let keep = table.add(Category::Message, recorder(&log, "keep"));
        let drop_me = table.add(Category::Message, recorder(&log, "drop"));

        assert!(table.remove(drop_me));
        assert!(!table.remove(drop_me));
        table.dispatch(&Message::notification("e", "x", "hi"));

        assert_eq!(*log.lock().unwrap(), vec!["keep:hi"]);
        assert!(table.remove(keep));
        assert_eq!(table.total(), 0);
    }

    #[test]
    fn test_panicking_handler_does_not_stop_others() {
        let table = HandlerTable::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        table.add(Category::Command, Arc::new(|_: &Message| panic!("boom")));
        table.add(Category::Command, recorder(&log, "after"));

        table.dispatch(&Message::command("e", "x", "stop"));
        assert_eq!(*log.lock().unwrap(), vec!["after:stop"]);
    }

    #[test]
    fn test_handlers_builder_entries() {
        let entries = Handlers::new().on_command(|_| {}).into_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, Category::Command);
        assert_eq!(Handlers::all(Arc::new(|_: &Message| {})).into_entries().len(), 3);
    }
}
