//! Maintains the routing tree: accepts `ADD_ROUTE` / `DEL_ROUTE` from
//! children, updates local tables, forwards upstream, and retracts routes
//! on stream disconnect.

use crate::{
    context::Context,
    message::MessageKind,
    router::Router,
    stream::ParentStream,
};
use std::sync::Arc;

/// Route announcement/retraction payloads, `"<id>"` or `"<id>:<name>"`.
pub fn encode_add_route(id: u32, name: Option<&str>) -> Vec<u8> {
    match name {
        Some(name) => format!("{}:{}", id, name).into_bytes(),
        None => id.to_string().into_bytes(),
    }
}

pub fn encode_del_route(id: u32) -> Vec<u8> {
    id.to_string().into_bytes()
}

pub fn decode_add_route(payload: &[u8]) -> Option<(u32, Option<String>)> {
    let text = std::str::from_utf8(payload).ok()?;
    match text.split_once(':') {
        Some((id, name)) => Some((id.parse().ok()?, Some(name.to_string()))),
        None => Some((text.parse().ok()?, None)),
    }
}

pub fn decode_del_route(payload: &[u8]) -> Option<u32> {
    std::str::from_utf8(payload).ok()?.parse().ok()
}

/// Maintains the router's route tables and the optional upstream
/// propagation path.
pub struct RouteMonitor {
    router: Arc<Router>,
}

impl RouteMonitor {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }

    /// Registers a freshly handshaken direct child: propagates
    /// `ADD_ROUTE(remote_id, name)` upstream and arranges for every route
    /// reached through it to be retracted when it disconnects.
    pub async fn notice_stream(&self, stream: Arc<ParentStream>) {
        let name = stream.name.clone();
        self.propagate_upstream(MessageKind::AddRoute, &encode_add_route(stream.remote_id, Some(&name)))
            .await;
        self.router.register_stream(stream);
    }

    /// Called once a stream has transitioned to `gone`. Retracts every
    /// route in its route-set, fires `disconnect` on each affected
    /// context, and propagates `DEL_ROUTE` upstream for each.
    pub async fn on_stream_disconnect(&self, stream: &ParentStream) {
        let ids: Vec<u32> = stream.routes.lock().drain().collect();
        let mut contexts = Vec::new();

        self.router.fail_pending_proxy_connects(&ids);

        for id in &ids {
            self.router.remove_route(*id);
            if let Some(context) = self.router.context(*id) {
                contexts.push(context);
            }
            self.propagate_upstream(MessageKind::DelRoute, &encode_del_route(*id))
                .await;
        }

        crate::stream::on_disconnect(stream, &contexts);
    }

    /// Handles an inbound `ADD_ROUTE`, gated by the immediate-child policy
    /// (caller has already verified `source_id == arrival_stream.remote_id`).
    pub async fn on_add_route(&self, arrival_stream: &Arc<ParentStream>, payload: &[u8]) {
        let Some((target_id, target_name)) = decode_add_route(payload) else {
            return;
        };

        if let Some(existing) = self.router.route(target_id) {
            // Literal equality with the default upstream route is not a
            // conflict; only an explicit route elsewhere is.
            let is_default_upstream = self.router.is_default_upstream(&existing);
            if !is_default_upstream && !Arc::ptr_eq(&existing, arrival_stream) {
                crate::log_warn!("conflicting ADD_ROUTE for context {}", target_id);
                return;
            }
        }

        arrival_stream.routes.lock().insert(target_id);
        self.router.install_route(target_id, arrival_stream.clone());
        if let Some(name) = target_name.as_deref() {
            self.router.context_or_create(target_id).set_name(name);
        }

        self.propagate_upstream(MessageKind::AddRoute, &encode_add_route(target_id, target_name.as_deref()))
            .await;
    }

    /// Handles an inbound `DEL_ROUTE`.
    pub async fn on_del_route(&self, arrival_stream: &Arc<ParentStream>, payload: &[u8]) {
        let Some(target_id) = decode_del_route(payload) else {
            return;
        };

        match self.router.route(target_id) {
            Some(route) if Arc::ptr_eq(&route, arrival_stream) => {}
            Some(_) => {
                crate::log_warn!("DEL_ROUTE for {} from non-owning stream", target_id);
                return;
            }
            None => return,
        }

        arrival_stream.routes.lock().remove(&target_id);
        self.router.remove_route(target_id);
        self.propagate_upstream(MessageKind::DelRoute, &encode_del_route(target_id))
            .await;

        if let Some(context) = self.router.context(target_id) {
            context.notify_disconnected();
        }
    }

    async fn propagate_upstream(&self, kind: MessageKind, payload: &[u8]) {
        if let Some(parent) = self.router.parent_stream() {
            let _ = parent
                .handler
                .send(&crate::message::Envelope::new(kind, 0, 0, payload.to_vec()))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_payload_roundtrips() {
        assert_eq!(decode_add_route(&encode_add_route(5, Some("x"))), Some((5, Some("x".to_string()))));
        assert_eq!(decode_add_route(&encode_add_route(5, None)), Some((5, None)));
        assert_eq!(decode_del_route(&encode_del_route(7)), Some(7));
    }
}
