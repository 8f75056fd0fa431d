// Live chat over WebSocket: one ConnectionSession per socket.

pub mod handler;
pub mod protocol;
pub mod session;

use std::sync::Arc;

use crate::auth::gate::AuthorizationGate;
use crate::auth::jwt::JwtIdentityService;
use crate::config::ChatConfig;
use crate::room::RoomRegistry;

pub use handler::router;
pub use session::ConnectionSession;

/// Shared services every connection talks to.
#[derive(Clone)]
pub struct ChatContext {
    pub identity: Arc<JwtIdentityService>,
    pub gate: AuthorizationGate,
    pub registry: RoomRegistry,
    pub config: ChatConfig,
}

impl ChatContext {
    pub fn new(
        identity: Arc<JwtIdentityService>,
        gate: AuthorizationGate,
        registry: RoomRegistry,
        config: ChatConfig,
    ) -> Self {
        Self { identity, gate, registry, config }
    }
}
