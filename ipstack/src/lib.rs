//! Userspace IPv4/TCP stack: link-layer framing, ARP, distance-vector
//! routing, a stop-and-wait TCP, and the socket layer applications link
//! against.
//!
//! [`net::NetStack`] owns devices, ARP, routing, IP, and TCP; [`net::socket::SocketLayer`]
//! layers blocking `socket`/`bind`/`listen`/`accept`/`connect`/`read`/`write`/`close`
//! semantics on top of it. [`lifecycle::ShutdownHooks`] orders teardown across
//! both.

pub mod lifecycle;
pub mod net;

pub use net::socket::SocketLayer;
pub use net::NetStack;

use std::sync::Arc;

/// Bring up a [`NetStack`] plus its [`SocketLayer`] and register the
/// standard link -> IP -> TCP -> socket shutdown ordering. This is the
/// entry point most callers want; `NetStack::new` and `SocketLayer::new`
/// remain available directly for callers assembling a custom shutdown
/// sequence.
pub struct Stack {
    pub net: Arc<NetStack>,
    pub sockets: Arc<SocketLayer>,
    pub shutdown: lifecycle::ShutdownHooks,
}

impl Stack {
    pub fn new(config: ipstack_support::StackConfig) -> Self {
        let net = NetStack::new(config);
        let sockets = Arc::new(SocketLayer::new(net.clone()));
        let shutdown = lifecycle::ShutdownHooks::new();

        // Link and IP hold no per-connection state that needs draining; both
        // hooks exist so the priority ordering stays complete and explicit
        // even though there's nothing to do at those layers today.
        shutdown.register(lifecycle::PRIORITY_LINK, "link", || {});
        shutdown.register(lifecycle::PRIORITY_IP, "ip", || {});
        {
            let net = net.clone();
            shutdown.register(lifecycle::PRIORITY_TCP, "tcp", move || net.tcp.shutdown());
        }
        {
            let sockets = sockets.clone();
            shutdown.register(lifecycle::PRIORITY_SOCKET, "socket", move || sockets.close_all());
        }

        Self { net, sockets, shutdown }
    }

    /// Start the background receive dispatchers (spawned per-interface by
    /// `add_interface`), the IP egress drain thread, and the distance-vector
    /// broadcaster. Call once, after every interface has been added.
    pub fn start(&self) {
        self.net.start_background_tasks();
    }

    /// Tear the stack down in link -> IP -> TCP -> socket order: every
    /// active TCB is forcibly closed and the reaper drains before every
    /// socket descriptor is released. Call once, at process exit.
    pub fn shutdown(&self) {
        self.shutdown.run_all();
    }
}
