//! Request dispatch
//!
//! One `match` over the decoded [`Opcode`], each arm an `async fn` that
//! reads and updates [`PersistentState`] and [`FileStore`] and returns the
//! response to send back, if any. No handler-registry / trait-object
//! indirection: there are exactly seven opcodes and they never change
//! independently of this crate, so a flat match is the simpler and more
//! honest shape here.

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::Result;
use crate::codec::{RequestHeader, RequestPayload, Response, decode_request_payload};
use crate::crypto;
use crate::database::PersistentState;
use crate::store::FileStore;

/// Decode and dispatch one request.
///
/// Returns `None` only for a not-yet-final file fragment, which the wire
/// protocol answers with silence rather than any response code. An
/// unrecognized opcode still gets an explicit 1607 generic-failure
/// response; the connection is kept open either way.
pub async fn dispatch(
    header: &RequestHeader,
    raw_payload: &[u8],
    state: &PersistentState,
    store: &FileStore,
) -> Option<Response> {
    let Some(opcode) = header.opcode() else {
        warn!(code = header.code, "unknown opcode");
        return Some(Response::GenericFailure);
    };

    let payload = match decode_request_payload(opcode, raw_payload) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(%err, ?opcode, "failed to decode request payload");
            return Some(Response::GenericFailure);
        }
    };

    let response = match payload {
        RequestPayload::Register { name } => Some(handle_register(state, &name).await),
        RequestPayload::SendPublicKey { name, public_key } => {
            Some(run(handle_send_public_key(header, state, &name, &public_key)).await)
        }
        RequestPayload::Reconnect { name } => {
            Some(run(handle_reconnect(header, state, &name)).await)
        }
        RequestPayload::SendFile {
            content_size,
            packet_number,
            total_packets,
            file_name,
            ciphertext,
            ..
        } => {
            run_optional(handle_send_file(
                header,
                state,
                store,
                content_size,
                packet_number,
                total_packets,
                &file_name,
                &ciphertext,
            ))
            .await
        }
        RequestPayload::CrcOk { file_name } => {
            Some(handle_crc_ok(header, state, store, &file_name).await)
        }
        RequestPayload::CrcNotOk { .. } => {
            handle_crc_not_ok(header, state).await;
            None
        }
        RequestPayload::CrcTerminate { .. } => {
            Some(handle_crc_terminate(header, state).await)
        }
    };

    response
}

/// Run a fallible handler, logging and folding any error into a generic
/// failure response rather than propagating it to the connection loop.
async fn run(fut: impl std::future::Future<Output = Result<Response>>) -> Response {
    match fut.await {
        Ok(response) => response,
        Err(err) => {
            warn!(%err, "request handler failed");
            Response::GenericFailure
        }
    }
}

async fn run_optional(fut: impl std::future::Future<Output = Result<Option<Response>>>) -> Option<Response> {
    match fut.await {
        Ok(response) => response,
        Err(err) => {
            warn!(%err, "request handler failed");
            Some(Response::GenericFailure)
        }
    }
}

async fn handle_register(state: &PersistentState, name: &str) -> Response {
    info!(name, "registering new client");
    match state.register(name, Utc::now()).await {
        Ok(Some(id_hex)) => {
            info!(name, id = id_hex, "client registered");
            let mut client_id = [0u8; 16];
            if let Ok(bytes) = hex::decode(&id_hex) {
                client_id.copy_from_slice(&bytes);
            }
            Response::RegisterSuccess { client_id }
        }
        Ok(None) => {
            warn!(name, "registration rejected: name already taken");
            Response::RegisterFailure
        }
        Err(err) => {
            warn!(%err, name, "registration failed");
            Response::RegisterFailure
        }
    }
}

async fn handle_send_public_key(
    header: &RequestHeader,
    state: &PersistentState,
    name: &str,
    public_key: &[u8],
) -> Result<Response> {
    let id_hex = header.client_id_hex();
    let Some(_client) = state.find(&id_hex, name).await else {
        return Ok(Response::RegisterFailure);
    };

    state.touch(&id_hex, Utc::now()).await?;
    state.set_public_key(&id_hex, public_key).await?;
    let aes_key = crypto::new_symmetric_key();

    match crypto::wrap(public_key, &aes_key) {
        Some(encrypted_key) => {
            state.set_symmetric_key(&id_hex, &aes_key).await?;
            debug!(id = id_hex, "AES session key wrapped and stored");
            Ok(Response::SendAes {
                client_id: header.client_id,
                encrypted_key,
            })
        }
        None => {
            warn!(id = id_hex, "failed to wrap AES key with client public key");
            Ok(Response::RegisterFailure)
        }
    }
}

async fn handle_reconnect(
    header: &RequestHeader,
    state: &PersistentState,
    name: &str,
) -> Result<Response> {
    let id_hex = header.client_id_hex();
    let Some(client) = state.find(&id_hex, name).await else {
        return Ok(Response::ReconnectFailure {
            client_id: header.client_id,
        });
    };
    state.touch(&id_hex, Utc::now()).await?;

    let Some(public_key) = client.public_key else {
        return Ok(Response::ReconnectFailure {
            client_id: header.client_id,
        });
    };

    let aes_key = crypto::new_symmetric_key();
    match crypto::wrap(&public_key, &aes_key) {
        Some(encrypted_key) => {
            state.set_symmetric_key(&id_hex, &aes_key).await?;
            Ok(Response::ReconnectSuccess {
                client_id: header.client_id,
                encrypted_key,
            })
        }
        None => Ok(Response::ReconnectFailure {
            client_id: header.client_id,
        }),
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_send_file(
    header: &RequestHeader,
    state: &PersistentState,
    store: &FileStore,
    content_size: u32,
    packet_number: u16,
    total_packets: u16,
    file_name: &str,
    ciphertext: &[u8],
) -> Result<Option<Response>> {
    let id_hex = header.client_id_hex();
    state.touch(&id_hex, Utc::now()).await?;

    if content_size == 0 {
        warn!(id = id_hex, file_name, "file content size is not correct");
        return Ok(Some(Response::GenericFailure));
    }

    info!(
        id = id_hex,
        file_name, packet_number, total_packets, "received file fragment"
    );
    let path = store
        .write_fragment(&id_hex, file_name, ciphertext, packet_number == 1)
        .await?;

    if packet_number != total_packets {
        return Ok(None);
    }

    let Some(client) = state.find_by_id(&id_hex).await else {
        return Ok(Some(Response::GenericFailure));
    };
    let Some(aes_key) = client.aes_key else {
        return Ok(Some(Response::GenericFailure));
    };

    store.decrypt_in_place(&path, &aes_key).await?;
    let path_str = path.to_string_lossy().into_owned();
    state.record_file(&id_hex, file_name, &path_str).await?;

    let plaintext = store.read(&path).await?;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&plaintext);
    let crc = hasher.finalize();

    info!(id = id_hex, file_name, crc, "file fully received");
    Ok(Some(Response::AcceptedFile {
        client_id: header.client_id,
        content_size,
        file_name: file_name.to_string(),
        crc,
    }))
}

async fn handle_crc_ok(
    header: &RequestHeader,
    state: &PersistentState,
    store: &FileStore,
    file_name: &str,
) -> Response {
    let id_hex = header.client_id_hex();
    let _ = state.touch(&id_hex, Utc::now()).await;
    let path = store.path_of(&id_hex, file_name);
    let _ = state.mark_verified(&path.to_string_lossy()).await;
    info!(id = id_hex, file_name, "file verified");
    Response::MessageConfirm {
        client_id: header.client_id,
    }
}

async fn handle_crc_not_ok(header: &RequestHeader, state: &PersistentState) {
    let id_hex = header.client_id_hex();
    let _ = state.touch(&id_hex, Utc::now()).await;
}

async fn handle_crc_terminate(header: &RequestHeader, state: &PersistentState) -> Response {
    let id_hex = header.client_id_hex();
    let _ = state.touch(&id_hex, Utc::now()).await;
    Response::MessageConfirm {
        client_id: header.client_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    fn name_field(name: &str) -> Vec<u8> {
        let mut field = vec![0u8; 255];
        field[..name.len()].copy_from_slice(name.as_bytes());
        field
    }

    fn header_for(client_id: [u8; 16], code: u16, payload_size: u32) -> RequestHeader {
        RequestHeader {
            client_id,
            version: 3,
            code,
            payload_size,
        }
    }

    #[tokio::test]
    async fn scenario_register_then_duplicate_name_fails() {
        let state = PersistentState::open("sqlite::memory:").await.unwrap();
        let store = FileStore::new(std::env::temp_dir().join("dispatcher-test-register"));

        let header = header_for([0u8; 16], 825, 255);
        let payload = name_field("alice");
        let response = dispatch(&header, &payload, &state, &store).await;
        assert!(matches!(response, Some(Response::RegisterSuccess { .. })));

        let response = dispatch(&header, &payload, &state, &store).await;
        assert!(matches!(response, Some(Response::RegisterFailure)));
    }

    #[tokio::test]
    async fn scenario_send_public_key_requires_registration() {
        let state = PersistentState::open("sqlite::memory:").await.unwrap();
        let store = FileStore::new(std::env::temp_dir().join("dispatcher-test-pubkey"));

        let mut payload = name_field("bob");
        payload.extend(vec![0x01u8; 160]);
        let header = header_for([9u8; 16], 826, payload.len() as u32);
        let response = dispatch(&header, &payload, &state, &store).await;
        assert!(matches!(response, Some(Response::RegisterFailure)));
    }

    #[tokio::test]
    async fn scenario_crc_not_ok_produces_no_response() {
        let state = PersistentState::open("sqlite::memory:").await.unwrap();
        let store = FileStore::new(std::env::temp_dir().join("dispatcher-test-crc-not-ok"));

        let header = header_for([0u8; 16], 825, 255);
        let _ = dispatch(&header, &name_field("carol"), &state, &store).await;

        let header = header_for([0u8; 16], 901, 255);
        let response = dispatch(&header, &name_field("foo.bin"), &state, &store).await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn scenario_crc_terminate_confirms() {
        let state = PersistentState::open("sqlite::memory:").await.unwrap();
        let store = FileStore::new(std::env::temp_dir().join("dispatcher-test-crc-terminate"));

        let header = header_for([3u8; 16], 902, 255);
        let response = dispatch(&header, &name_field("foo.bin"), &state, &store).await;
        assert!(matches!(response, Some(Response::MessageConfirm { .. })));
    }

    #[tokio::test]
    async fn scenario_send_file_zero_content_size_is_rejected() {
        let state = PersistentState::open("sqlite::memory:").await.unwrap();
        let store = FileStore::new(std::env::temp_dir().join("dispatcher-test-zero-size"));

        let mut payload = BytesMut::new();
        payload.put_u32_le(0); // content_size
        payload.put_u32_le(0);
        payload.put_u16_le(1);
        payload.put_u16_le(1);
        payload.put_slice(&name_field("foo.bin"));
        payload.put_slice(&[1, 2, 3, 4]);

        let header = header_for([1u8; 16], 828, payload.len() as u32);
        let response = dispatch(&header, &payload, &state, &store).await;
        assert!(matches!(response, Some(Response::GenericFailure)));
    }

    #[tokio::test]
    async fn scenario_send_file_intermediate_fragment_has_no_response() {
        let state = PersistentState::open("sqlite::memory:").await.unwrap();
        let store = FileStore::new(std::env::temp_dir().join("dispatcher-test-fragment"));

        let mut payload = BytesMut::new();
        payload.put_u32_le(32);
        payload.put_u32_le(32);
        payload.put_u16_le(1); // packet 1 of 2
        payload.put_u16_le(2);
        payload.put_slice(&name_field("foo.bin"));
        payload.put_slice(&[0u8; 16]);

        let header = header_for([2u8; 16], 828, payload.len() as u32);
        let response = dispatch(&header, &payload, &state, &store).await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn scenario_unknown_opcode_gets_generic_failure() {
        let state = PersistentState::open("sqlite::memory:").await.unwrap();
        let store = FileStore::new(std::env::temp_dir().join("dispatcher-test-unknown"));
        let header = header_for([0u8; 16], 42, 0);
        let response = dispatch(&header, &[], &state, &store).await;
        assert!(matches!(response, Some(Response::GenericFailure)));
    }
}
