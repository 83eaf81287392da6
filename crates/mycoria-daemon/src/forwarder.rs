//! The router core: deliver or forward inbound frames.
//!
//! Frames arrive from the link readers already unsealed at the link layer.
//! Frames for the local router are handed to their endpoint; transit frames
//! are rotated one hop through the switch block and re-sent on the next
//! link. End-to-end protection stays intact either way: rotation never
//! touches the sealed payload.

use std::sync::Arc;

use mycoria_frame::frame::{Frame, MessageType};
use mycoria_peering::{Link, LinkManager};
use mycoria_router::RouteSource;
use mycoria_switch::SwitchLabel;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Drain inbound frames until cancelled.
pub async fn run(
    manager: Arc<LinkManager>,
    mut inbound: mpsc::Receiver<(Arc<Link>, Frame)>,
    cancel: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            () = cancel.cancelled() => return,
            received = inbound.recv() => received,
        };
        let Some((link, frame)) = received else { return };
        handle_frame(&manager, &link, frame);
    }
}

fn handle_frame(manager: &Arc<LinkManager>, from: &Arc<Link>, mut frame: Frame) {
    let local_ip = manager.local().ip();

    if frame.dst() == local_ip {
        deliver_local(manager, from, frame);
        return;
    }

    // Transit.
    if frame.decrement_ttl() {
        trace!(src = %frame.src(), dst = %frame.dst(), "ttl spent, frame dropped");
        manager.frames().recycle_frame(frame);
        return;
    }

    // Source-routed frames name their own next hop; the return label keeps
    // the reverse path intact.
    if !frame.switch_block().is_empty() {
        match frame.rotate_switch_block(from.label()) {
            Ok(next) if !next.is_terminal() => {
                forward_by_label(manager, frame, next);
                return;
            }
            Ok(_) => {
                // The path ends here but the frame is not ours.
                trace!(dst = %frame.dst(), "switch path ended short of its destination");
                manager.frames().recycle_frame(frame);
                return;
            }
            Err(err) => {
                debug!(%err, "switch rotation failed, frame dropped");
                manager.frames().recycle_frame(frame);
                return;
            }
        }
    }

    // No switch block: pick the best route ourselves.
    forward_by_table(manager, frame);
}

fn deliver_local(manager: &Arc<LinkManager>, from: &Arc<Link>, frame: Frame) {
    match frame.message_type() {
        MessageType::RouterHopPing | MessageType::RouterPing => {
            // Pings measure liveness and path delay.
            trace!(src = %frame.src(), "ping received");
            if let Some(session) = manager.sessions().get(from.remote_ip()) {
                session.touch();
            }
        }
        MessageType::RouterCtrl | MessageType::SessionCtrl => {
            trace!(src = %frame.src(), "control frame received");
        }
        MessageType::NetworkTraffic | MessageType::SessionData => {
            // Handed to the TUN device by the interface layer.
            trace!(src = %frame.src(), len = frame.as_bytes().len(), "payload frame received");
        }
    }
    manager.frames().recycle_frame(frame);
}

fn forward_by_label(manager: &Arc<LinkManager>, frame: Frame, label: SwitchLabel) {
    match manager.link_by_label(label) {
        Some(link) => {
            if !link.send(frame) {
                trace!(%label, "next hop queue full, frame dropped");
            }
        }
        None => {
            debug!(%label, "no link behind switch label, frame dropped");
        }
    }
}

fn forward_by_table(manager: &Arc<LinkManager>, frame: Frame) {
    let dst = frame.dst();
    let Some(route) = manager.table().lookup_nearest_route(dst) else {
        trace!(%dst, "no route, frame dropped");
        manager.frames().recycle_frame(frame);
        return;
    };

    let next_hop = match route.source {
        RouteSource::Peer => route.dst,
        _ => route.next_hop,
    };
    match manager.link_by_address(next_hop) {
        Some(link) => {
            if !link.send(frame) {
                trace!(%next_hop, "next hop queue full, frame dropped");
            }
        }
        None => {
            debug!(%next_hop, "route points at a disconnected peer, frame dropped");
        }
    }
}
