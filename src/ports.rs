//! Port assignment for isolated apps

use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, error, warn};

struct PortTable {
    /// port -> owning app
    claims: HashMap<u16, String>,
    /// Next auto-assignment candidate, `None` once the counter passed 65535
    next: Option<u16>,
}

/// Hands out listener ports to isolated apps.
///
/// A manifest's preferred port is honoured unless another app already holds
/// it. Everything else comes from a counter starting at the base port.
pub struct PortAllocator {
    inner: Mutex<PortTable>,
}

impl PortAllocator {
    pub fn new(base_port: u16) -> Self {
        Self {
            inner: Mutex::new(PortTable {
                claims: HashMap::new(),
                next: Some(base_port),
            }),
        }
    }

    /// Assign a port to `app`. Calling again for the same app returns its existing claim.
    ///
    /// Auto-assignment counts upward and never wraps; `None` means every port
    /// from the counter to 65535 is taken.
    pub fn assign(&self, app: &str, preferred: Option<u16>) -> Option<u16> {
        let mut table = self.inner.lock();

        if let Some(port) = table
            .claims
            .iter()
            .find_map(|(port, owner)| (owner == app).then_some(*port))
        {
            return Some(port);
        }

        if let Some(port) = preferred {
            match table.claims.get(&port) {
                None => {
                    table.claims.insert(port, app.to_string());
                    debug!(app, port, "Assigned preferred port");
                    return Some(port);
                }
                Some(owner) => {
                    warn!(app, port, owner = %owner, "Preferred port already claimed, auto-assigning");
                }
            }
        }

        let Some(mut port) = table.next else {
            error!(app, "No free port left for auto-assignment");
            return None;
        };
        while table.claims.contains_key(&port) {
            let Some(next) = port.checked_add(1) else {
                error!(app, "No free port left for auto-assignment");
                table.next = None;
                return None;
            };
            port = next;
        }
        table.next = port.checked_add(1);
        table.claims.insert(port, app.to_string());
        debug!(app, port, "Auto-assigned port");
        Some(port)
    }

    pub fn port_of(&self, app: &str) -> Option<u16> {
        self.inner
            .lock()
            .claims
            .iter()
            .find_map(|(port, owner)| (owner == app).then_some(*port))
    }

    pub fn claimed(&self) -> usize {
        self.inner.lock().claims.len()
    }
}
