//! TURN request and indication handlers.
//!
//! Each handler takes a decoded message plus the allocation manager and
//! produces the response to send back (requests) or forwards silently
//! (indications). Authentication happens before these are called.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::allocation::AllocationManager;
use crate::agent::TransportProtocol;
use crate::error::Result;
use crate::message::{
    Attribute, MessageBuilder, MessageClass, Method, StunMessage, TransactionId, TRANSPORT_UDP,
};

/// Build an error response mirroring the request's method and transaction id.
pub fn error_response(req: &StunMessage, code: u16, reason: &str) -> Result<StunMessage> {
    let mut builder = MessageBuilder::new(
        MessageClass::ErrorResponse,
        req.header.method,
        req.header.transaction_id,
    );
    builder.add_attr(Attribute::ErrorCode { code, reason: reason.into() })?;
    Ok(builder.build())
}

/// Build a 401 challenge carrying the server's realm and nonce.
pub fn challenge_response(req: &StunMessage, realm: &str, nonce: &[u8]) -> Result<StunMessage> {
    let mut builder = MessageBuilder::new(
        MessageClass::ErrorResponse,
        req.header.method,
        req.header.transaction_id,
    );
    builder.add_attr(Attribute::ErrorCode { code: 401, reason: "Unauthorized".into() })?;
    builder.add_attr(Attribute::Realm(realm.into()))?;
    builder.add_attr(Attribute::Nonce(nonce.to_vec()))?;
    Ok(builder.build())
}

/// Wrap a peer datagram in a Data indication for the client.
pub fn data_indication(peer: SocketAddr, payload: &[u8]) -> Result<StunMessage> {
    let mut builder =
        MessageBuilder::new(MessageClass::Indication, Method::Data, TransactionId::new());
    builder.add_attr(Attribute::XorPeerAddress(peer))?;
    builder.add_attr(Attribute::Data(payload.to_vec()))?;
    Ok(builder.build())
}

/// Serve an Allocate request from `src`.
///
/// Rejects anything that is not an Allocate request (400), a missing or
/// non-UDP REQUESTED-TRANSPORT (400 / 442), and an already-allocated
/// five-tuple (437). On success the response carries the granted LIFETIME,
/// SOFTWARE, the client's reflexive address and the relayed address.
pub async fn handle_allocate(
    manager: &Arc<AllocationManager>,
    software: &str,
    msg: &StunMessage,
    src: SocketAddr,
) -> Result<StunMessage> {
    if !msg.is_request(Method::Allocate) {
        return error_response(msg, 400, "Bad Request");
    }

    let Some(transport) = msg.requested_transport() else {
        debug!("allocate from {} without REQUESTED-TRANSPORT", src);
        return error_response(msg, 400, "Bad Request");
    };
    if transport != TRANSPORT_UDP {
        debug!("allocate from {} requested transport {}, only UDP served", src, transport);
        return error_response(msg, 442, "Unsupported Transport Protocol");
    }

    let requested_lifetime = msg.lifetime().map(|secs| Duration::from_secs(secs as u64));
    let allocation = match manager
        .allocate(src, TransportProtocol::Udp, requested_lifetime)
        .await
    {
        Ok(allocation) => allocation,
        Err(e) => {
            debug!("allocate from {} refused: {}", src, e);
            let (code, reason) =
                e.protocol_code().unwrap_or((437, "Allocation Mismatch"));
            return error_response(msg, code, reason);
        }
    };

    let mut builder = MessageBuilder::new(
        MessageClass::SuccessResponse,
        Method::Allocate,
        msg.header.transaction_id,
    );
    builder.add_attr(Attribute::Lifetime(allocation.lifetime().as_secs() as u32))?;
    builder.add_attr(Attribute::Software(software.into()))?;
    builder.add_attr(Attribute::XorMappedAddress(src))?;
    builder.add_attr(Attribute::XorRelayedAddress(allocation.relayed_addr()))?;
    Ok(builder.build())
}

/// Serve a CreatePermission request from `src`.
///
/// Installs a permission for the XOR-PEER-ADDRESS's IP on the client's
/// allocation. 400 without a peer address, 437 without an allocation.
pub async fn handle_create_permission(
    manager: &Arc<AllocationManager>,
    msg: &StunMessage,
    src: SocketAddr,
) -> Result<StunMessage> {
    if !msg.is_request(Method::CreatePermission) {
        return error_response(msg, 400, "Bad Request");
    }
    let Some(peer) = msg.xor_peer_address() else {
        debug!("create-permission from {} without XOR-PEER-ADDRESS", src);
        return error_response(msg, 400, "Bad Request");
    };

    match manager.install_permission(src, TransportProtocol::Udp, peer).await {
        Ok(()) => {
            let builder = MessageBuilder::new(
                MessageClass::SuccessResponse,
                Method::CreatePermission,
                msg.header.transaction_id,
            );
            Ok(builder.build())
        }
        Err(e) => {
            debug!("create-permission from {} refused: {}", src, e);
            let (code, reason) = e.protocol_code().unwrap_or((437, "Allocation Mismatch"));
            error_response(msg, code, reason)
        }
    }
}

/// Forward a Send indication's DATA to its XOR-PEER-ADDRESS.
///
/// Indications are never answered: a missing allocation, a missing
/// attribute or an unpermitted peer just drops the payload.
pub async fn handle_send(manager: &Arc<AllocationManager>, msg: &StunMessage, src: SocketAddr) {
    if !msg.is_indication(Method::Send) {
        debug!("ignoring non-send message from {} on the indication path", src);
        return;
    }
    let (Some(peer), Some(payload)) = (msg.xor_peer_address(), msg.data()) else {
        debug!("send indication from {} missing XOR-PEER-ADDRESS or DATA", src);
        return;
    };
    let Some(allocation) = manager.get(src, TransportProtocol::Udp).await else {
        debug!("send indication from {} with no allocation", src);
        return;
    };
    if !allocation.permits(peer.ip()) {
        debug!("send indication from {} to unpermitted peer {}", src, peer);
        return;
    }
    if let Err(e) = allocation.send_to_peer(peer, payload).await {
        debug!("relay send from {} to {} failed: {}", src, peer, e);
    }
}
