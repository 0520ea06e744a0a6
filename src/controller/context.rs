//! Per-message dispatch context.
//!
//! Contexts are recycled through a thread-local free list; dispatch runs
//! without suspension points, so allocation and release always happen on
//! the same thread.
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;

/// Context key under which the parsed PACKET_IN Ethernet payload is stored.
pub const CONTEXT_PI_PAYLOAD: &str = "kestrel.core.packet_in_payload";

/// Scratch storage shared by the listeners of a single dispatched message.
#[derive(Default)]
pub struct MessageContext {
    storage: HashMap<&'static str, Box<dyn Any + Send>>,
}

impl MessageContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put<T: Any + Send>(&mut self, key: &'static str, value: T) {
        self.storage.insert(key, Box::new(value));
    }

    pub fn get<T: Any + Send>(&self, key: &'static str) -> Option<&T> {
        self.storage.get(key).and_then(|v| v.downcast_ref())
    }

    pub fn remove<T: Any + Send>(&mut self, key: &'static str) -> Option<T> {
        self.storage
            .remove(key)
            .and_then(|v| v.downcast::<T>().ok())
            .map(|v| *v)
    }

    pub fn clear(&mut self) {
        self.storage.clear();
    }
}

thread_local! {
    static CONTEXT_POOL: RefCell<Vec<MessageContext>> = const { RefCell::new(Vec::new()) };
}

/// Pop a context off the thread's free list, or create a fresh one.
pub(crate) fn alloc_context() -> MessageContext {
    CONTEXT_POOL.with(|pool| pool.borrow_mut().pop().unwrap_or_default())
}

/// Return a context to the thread's free list.
pub(crate) fn free_context(mut ctx: MessageContext) {
    ctx.clear();
    CONTEXT_POOL.with(|pool| pool.borrow_mut().push(ctx));
}
