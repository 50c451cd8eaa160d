//! The five request handlers and the four unsolicited event shapes.
//!
//! Every response starts with `i` so the browser-side compatibility
//! layer (which reads fields positionally in some builds) keeps working;
//! `JsonObject` preserves insertion order for exactly this reason.

use log::debug;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::apdu;
use crate::error::HostError;
use crate::json::{JsonObject, JsonValue};
use crate::registry::ReaderRegistry;
use crate::resource_manager::{ProtocolMask, ResourceManager, ShareMode};

/// Request command codes (the wire's `c` field). An unrecognized code is
/// not an error — it falls through to the unknown-command no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(i64)]
enum Command {
    ListReaders = 1,
    Connect = 2,
    Disconnect = 3,
    Transceive = 4,
    Version = 10,
}

/// Unsolicited event codes (the wire's `e` field).
#[derive(Debug, Clone, Copy, IntoPrimitive, TryFromPrimitive)]
#[repr(i64)]
pub enum Event {
    CardInsert = 1,
    CardRemove = 2,
    ReadersAdded = 3,
    ReadersRemoved = 4,
}

/// Handle one parsed request object, returning the response to write
/// back. Never fails: any internal error collapses to `incomplete: true`
/// per the wire contract, so the event loop can always write exactly one
/// response frame per request.
pub fn dispatch(
    registry: &mut ReaderRegistry,
    rm: &mut dyn ResourceManager,
    request: &JsonObject,
) -> JsonObject {
    let id = request
        .get("i")
        .and_then(JsonValue::as_str)
        .unwrap_or("")
        .to_string();
    let code = request.get("c").and_then(JsonValue::as_f64).unwrap_or(-1.0) as i64;
    let command = Command::try_from(code);

    let mut response = JsonObject::new();
    response.push("i", JsonValue::String(id.clone()));

    let outcome = match command {
        Ok(Command::ListReaders) => Ok(list_readers(registry)),
        Ok(Command::Connect) => handle_connect(registry, rm, request),
        Ok(Command::Disconnect) => handle_disconnect(registry, rm, request),
        Ok(Command::Transceive) => handle_transceive(registry, rm, request),
        Ok(Command::Version) => Ok(version()),
        Err(_) => Ok(Vec::new()),
    };

    match outcome {
        Ok(fields) => {
            for (key, value) in fields {
                response.push(key, value);
            }
        }
        Err(err) => {
            debug!("request {id} (c={code}) failed: {err}");
            response.push("incomplete", JsonValue::Bool(true));
        }
    }
    response
}

type Fields = Vec<(&'static str, JsonValue)>;

fn list_readers(registry: &ReaderRegistry) -> Fields {
    let entries = registry
        .readers()
        .iter()
        .map(|r| {
            let mut obj = JsonObject::new();
            obj.push("n", JsonValue::String(r.name.clone()));
            obj.push("a", JsonValue::String(encode_hex_upper(&r.atr)));
            JsonValue::Object(obj)
        })
        .collect();
    vec![("d", JsonValue::Array(entries))]
}

fn version() -> Fields {
    vec![(
        "verNat",
        JsonValue::String(env!("CARGO_PKG_VERSION").to_string()),
    )]
}

fn reader_index(request: &JsonObject, reader_count: usize) -> Result<usize, HostError> {
    let r = request
        .get("r")
        .and_then(JsonValue::as_f64)
        .ok_or_else(|| HostError::Protocol("missing or non-numeric r".into()))?;
    if r < 0.0 || r.fract() != 0.0 || r as usize >= reader_count {
        return Err(HostError::Protocol("r out of range".into()));
    }
    Ok(r as usize)
}

fn share_mode(request: &JsonObject) -> Result<ShareMode, HostError> {
    match request.get("p") {
        None => Ok(ShareMode::Shared),
        Some(v) => {
            let code = v
                .as_f64()
                .ok_or_else(|| HostError::Protocol("p must be a number".into()))?;
            ShareMode::from_wire(code as i64)
                .ok_or_else(|| HostError::Protocol("unknown share mode".into()))
        }
    }
}

fn handle_connect(
    registry: &mut ReaderRegistry,
    rm: &mut dyn ResourceManager,
    request: &JsonObject,
) -> Result<Fields, HostError> {
    let index = reader_index(request, registry.readers().len())?;
    let mode = share_mode(request)?;
    let protocols = match mode {
        ShareMode::Direct => ProtocolMask::empty(),
        _ => ProtocolMask::T0 | ProtocolMask::T1,
    };
    let entry = registry.get_mut(index).expect("index validated above");
    let name = entry.name.clone();
    entry.connection.open(rm, &name, mode, protocols)?;
    let atr = entry.atr.clone();
    Ok(vec![("d", JsonValue::String(encode_hex_upper(&atr)))])
}

fn handle_disconnect(
    registry: &mut ReaderRegistry,
    rm: &mut dyn ResourceManager,
    request: &JsonObject,
) -> Result<Fields, HostError> {
    let index = reader_index(request, registry.readers().len())?;
    let entry = registry.get_mut(index).expect("index validated above");
    entry.connection.close(rm)?;
    Ok(Vec::new())
}

fn handle_transceive(
    registry: &mut ReaderRegistry,
    rm: &mut dyn ResourceManager,
    request: &JsonObject,
) -> Result<Fields, HostError> {
    let index = reader_index(request, registry.readers().len())?;
    let hex = request
        .get("a")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| HostError::Protocol("missing a".into()))?;
    let command = decode_hex(hex).ok_or_else(|| HostError::Protocol("malformed apdu hex".into()))?;
    let entry = registry.get(index).expect("index validated above");
    let response = apdu::transceive(&entry.connection, rm, &command)?;
    Ok(vec![("d", JsonValue::String(encode_hex_upper(&response)))])
}

pub fn card_insert_event(reader_index: usize, atr: &[u8]) -> JsonObject {
    let mut obj = JsonObject::new();
    obj.push("e", JsonValue::Number(i64::from(Event::CardInsert) as f64));
    obj.push("r", JsonValue::Number(reader_index as f64));
    obj.push("d", JsonValue::String(encode_hex_upper(atr)));
    obj
}

pub fn card_remove_event(reader_index: usize) -> JsonObject {
    let mut obj = JsonObject::new();
    obj.push("e", JsonValue::Number(i64::from(Event::CardRemove) as f64));
    obj.push("r", JsonValue::Number(reader_index as f64));
    obj
}

pub fn readers_added_event(names: &[String]) -> JsonObject {
    names_event(Event::ReadersAdded, names)
}

pub fn readers_removed_event(names: &[String]) -> JsonObject {
    names_event(Event::ReadersRemoved, names)
}

fn names_event(event: Event, names: &[String]) -> JsonObject {
    let mut obj = JsonObject::new();
    obj.push("e", JsonValue::Number(i64::from(event) as f64));
    obj.push(
        "n",
        JsonValue::Array(names.iter().cloned().map(JsonValue::String).collect()),
    );
    obj
}

fn encode_hex_upper(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02X}");
    }
    out
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() / 2);
    for chunk in bytes.chunks(2) {
        let hi = (chunk[0] as char).to_digit(16)?;
        let lo = (chunk[1] as char).to_digit(16)?;
        out.push((hi as u8) << 4 | lo as u8);
    }
    Some(out)
}
