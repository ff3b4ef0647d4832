//! Route handlers
//!
//! Hardware work runs on the blocking pool through [`blocking`]; each handler
//! sees the settings snapshot pinned when its request entered the pipeline.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use remocard_apdu_core::{ReaderInfo, decode_hex, encode_hex};
use tracing::{debug, info, trace};

use super::middleware::{Sealed, blocking};
use crate::api::{
    ApduRequest, ChannelRequest, HandshakeRequest, ListChannelsResponse, ListSlotsResponse,
    OpenChannelResponse, SettingsRequest, SlotEntry, SuccessResponse, TransmitResponse,
    VersionInfo,
};
use crate::config::Settings;
use crate::error::BridgeError;
use crate::overlay::Plaintext;
use crate::registry::{self, ChannelKey};
use crate::slots::ISD_R_AID;
use crate::state::AppState;

type Snapshot = Extension<Arc<Settings>>;

/// Named reader if given, otherwise the first one, checked against the
/// allow-list
///
/// A named reader outside the allow-list is refused before its existence is
/// checked.
fn resolve_reader(
    settings: &Settings,
    readers: Vec<ReaderInfo>,
    requested: Option<&str>,
) -> Result<ReaderInfo, BridgeError> {
    if let Some(name) = requested
        && !settings.reader_allowed(name)
    {
        return Err(BridgeError::AccessDenied);
    }
    let reader = match requested {
        Some(name) => readers.into_iter().find(|r| r.name == name),
        None => readers.into_iter().next(),
    }
    .ok_or(BridgeError::ReaderNotFound)?;

    if settings.reader_allowed(&reader.name) {
        Ok(reader)
    } else {
        Err(BridgeError::AccessDenied)
    }
}

/// Reader name for channel lookups; falls back to the first reader, or an
/// empty name when there is none
fn lookup_reader(state: &AppState, requested: Option<String>) -> Result<String, BridgeError> {
    match requested {
        Some(name) => Ok(name),
        None => Ok(state
            .service()
            .readers()?
            .into_iter()
            .next()
            .map(|r| r.name)
            .unwrap_or_default()),
    }
}

pub(crate) async fn version(Extension(settings): Snapshot) -> impl IntoResponse {
    (Extension(Plaintext), Json(VersionInfo::new(&settings)))
}

pub(crate) async fn handshake(
    State(state): State<AppState>,
    Extension(settings): Snapshot,
    body: Bytes,
) -> Response {
    let result = serde_json::from_slice::<HandshakeRequest>(&body)
        .map_err(|e| BridgeError::Protocol(format!("Invalid request body: {e}")))
        .map(|request| Json(state.keys().handshake(&settings.password, &request.client_nonce)));
    (Extension(Plaintext), result).into_response()
}

pub(crate) async fn list_slots(
    State(state): State<AppState>,
    Extension(settings): Snapshot,
) -> Result<Json<ListSlotsResponse>, BridgeError> {
    let readers = blocking({
        let state = state.clone();
        move || Ok(state.service().readers()?)
    })
    .await?;

    let slots = readers
        .into_iter()
        .filter(|reader| settings.reader_allowed(&reader.name))
        .map(|reader| {
            let detected = state.slots().get(&reader.name).unwrap_or_default();
            SlotEntry {
                name: reader.name,
                is_present: reader.present,
                eid: detected.eid,
                aid: detected.aid,
            }
        })
        .collect();
    Ok(Json(ListSlotsResponse { slots }))
}

pub(crate) async fn open_channel(
    State(state): State<AppState>,
    Extension(settings): Snapshot,
    Sealed(request): Sealed<ChannelRequest>,
) -> Result<Json<OpenChannelResponse>, BridgeError> {
    blocking(move || {
        let readers = state.service().readers()?;
        let reader = resolve_reader(&settings, readers, request.reader.as_deref())?;

        let registry = state.registry();
        let opened = if settings.single_channel {
            debug!("Single-channel mode, replacing open channels");
            registry.replace_all(state.service(), &reader.name, &request.aids)?
        } else {
            registry.open_channel(state.service(), &reader.name, &request.aids)?
        };
        Ok(Json(match opened {
            Some(aid) => OpenChannelResponse::opened(aid, reader.name),
            None => {
                info!(reader = %reader.name, aids = ?request.aids, "No AID could be selected");
                OpenChannelResponse::failed()
            }
        }))
    })
    .await
}

pub(crate) async fn send_apdu(
    State(state): State<AppState>,
    Extension(settings): Snapshot,
    Sealed(request): Sealed<ApduRequest>,
) -> Result<Json<TransmitResponse>, BridgeError> {
    blocking(move || {
        let reader = lookup_reader(&state, request.reader)?;
        if !settings.reader_allowed(&reader) {
            return Err(BridgeError::AccessDenied);
        }

        let command = decode_hex(&request.apdu)?;
        let key = ChannelKey::new(reader, request.aid.as_deref().unwrap_or_default());
        let channel = state
            .registry()
            .channel(&key)
            .ok_or_else(|| BridgeError::ChannelNotFound {
                reader: key.reader().to_owned(),
                aid: key.aid().to_owned(),
            })?;

        trace!(%key, command = %encode_hex(&command), "Command");
        let response = encode_hex(&channel.exchange(state.transceiver(), &command)?);
        trace!(%key, %response, "Response");
        Ok(Json(TransmitResponse { response }))
    })
    .await
}

pub(crate) async fn send_raw_apdu(
    State(state): State<AppState>,
    Extension(settings): Snapshot,
    Sealed(request): Sealed<ApduRequest>,
) -> Result<Json<TransmitResponse>, BridgeError> {
    blocking(move || {
        let readers = state.service().readers()?;
        let reader = resolve_reader(&settings, readers, request.reader.as_deref())?;
        let command = decode_hex(&request.apdu)?;
        let aid = decode_hex(ISD_R_AID)?;

        trace!(reader = %reader.name, command = %encode_hex(&command), "Raw command");
        let response = registry::exchange_once(
            state.service(),
            state.transceiver(),
            &reader.name,
            &aid,
            &command,
        )?
        .ok_or_else(|| BridgeError::Internal(format!("Failed to open channel to {ISD_R_AID}")))?;

        let response = encode_hex(&response);
        trace!(reader = %reader.name, %response, "Raw response");
        Ok(Json(TransmitResponse { response }))
    })
    .await
}

pub(crate) async fn close_channel(
    State(state): State<AppState>,
    Extension(settings): Snapshot,
    Sealed(request): Sealed<ChannelRequest>,
) -> Result<Json<SuccessResponse>, BridgeError> {
    blocking(move || {
        let reader = lookup_reader(&state, request.reader)?;
        if !settings.reader_allowed(&reader) {
            return Err(BridgeError::AccessDenied);
        }

        for aid in &request.aids {
            let key = ChannelKey::new(reader.as_str(), aid);
            if !state.registry().close_channel(&key) {
                debug!(%key, "No channel to close");
            }
        }
        Ok(Json(SuccessResponse::ok()))
    })
    .await
}

pub(crate) async fn list_channels(State(state): State<AppState>) -> Json<ListChannelsResponse> {
    let channels = state
        .registry()
        .channel_keys()
        .iter()
        .map(ToString::to_string)
        .collect();
    Json(ListChannelsResponse { channels })
}

pub(crate) async fn update_settings(
    State(state): State<AppState>,
    Sealed(request): Sealed<SettingsRequest>,
) -> Result<Json<SuccessResponse>, BridgeError> {
    blocking(move || {
        state.settings().update(&request)?;
        Ok(Json(SuccessResponse::with_message(
            "Settings updated. Port change requires server restart.",
        )))
    })
    .await
}
