//! Graceful shutdown ordering.
//!
//! Hooks run lowest-priority-first, so upper layers get a chance to flush
//! through still-live lower layers: link, then IP, then TCP, then the
//! socket layer.

use std::sync::Mutex;

pub const PRIORITY_LINK: i32 = 0;
pub const PRIORITY_IP: i32 = 10;
pub const PRIORITY_TCP: i32 = 20;
pub const PRIORITY_SOCKET: i32 = 30;

struct Hook {
    priority: i32,
    name: &'static str,
    run: Box<dyn FnMut() + Send>,
}

/// A registry of shutdown actions, invoked in ascending priority order by
/// [`ShutdownHooks::run_all`].
#[derive(Default)]
pub struct ShutdownHooks {
    hooks: Mutex<Vec<Hook>>,
}

impl ShutdownHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, priority: i32, name: &'static str, run: impl FnMut() + Send + 'static) {
        let mut hooks = self.hooks.lock().unwrap();
        hooks.push(Hook {
            priority,
            name,
            run: Box::new(run),
        });
        hooks.sort_by_key(|h| h.priority);
    }

    /// Run every registered hook in priority order. Not reentrant; intended
    /// to be called exactly once at process teardown.
    pub fn run_all(&self) {
        let mut hooks = self.hooks.lock().unwrap();
        for hook in hooks.iter_mut() {
            log::info!("lifecycle: shutdown hook '{}' (priority {})", hook.name, hook.priority);
            (hook.run)();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    #[test]
    fn hooks_run_in_priority_order() {
        let hooks = ShutdownHooks::new();
        let order = Arc::new(StdMutex::new(Vec::new()));

        let o1 = order.clone();
        hooks.register(PRIORITY_TCP, "tcp", move || o1.lock().unwrap().push("tcp"));
        let o2 = order.clone();
        hooks.register(PRIORITY_LINK, "link", move || o2.lock().unwrap().push("link"));
        let o3 = order.clone();
        hooks.register(PRIORITY_SOCKET, "socket", move || o3.lock().unwrap().push("socket"));
        let o4 = order.clone();
        hooks.register(PRIORITY_IP, "ip", move || o4.lock().unwrap().push("ip"));

        hooks.run_all();
        assert_eq!(*order.lock().unwrap(), vec!["link", "ip", "tcp", "socket"]);
    }
}
