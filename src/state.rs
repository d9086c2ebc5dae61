/// `state.rs` — Persisted-state blob
///
/// The host stores one object atom per plugin instance: the script text, the
/// version that wrote it and whatever the script forged in `save`. Decoding
/// validates every field on its own, so a truncated or mistyped field is
/// dropped without losing the others.
use crate::atom::urid::Uris;
use crate::atom::{AtomBuf, AtomRef};
use crate::error::{Error, Result};
use crate::forge::{Forge, ForgeCursor};

pub const MINOR_VERSION: i32 = 1;
pub const MICRO_VERSION: i32 = 0;

/// Space for the object, property and scalar headers around the payload.
const OVERHEAD: usize = 128;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistedState {
    pub code: Option<String>,
    pub minor_version: Option<i32>,
    pub micro_version: Option<i32>,
    /// Atom forged by the script's `save` callback.
    pub state: Option<AtomBuf>,
}

impl PersistedState {
    /// State written by this version of the engine.
    pub fn new(code: impl Into<String>, state: Option<AtomBuf>) -> Self {
        Self {
            code: Some(code.into()),
            minor_version: Some(MINOR_VERSION),
            micro_version: Some(MICRO_VERSION),
            state,
        }
    }

    /// False when the blob was written by an incompatible minor version.
    pub fn is_compatible(&self) -> bool {
        self.minor_version.map_or(true, |v| v == MINOR_VERSION)
    }

    pub fn encode(&self, uris: &Uris) -> Result<Vec<u8>> {
        let code_len = self.code.as_ref().map_or(0, String::len);
        let state_len = self.state.as_ref().map_or(0, |s| s.as_bytes().len());
        let mut buf = vec![0u8; code_len + state_len + OVERHEAD];
        let mut cursor = ForgeCursor::new();
        let len = {
            let mut forge = Forge::new(&mut buf, &mut cursor, uris);
            let e = uris.engine;
            let frame = forge.push_object(0, e.state)?;
            if let Some(code) = &self.code {
                forge.key(e.code, 0)?;
                forge.string(code)?;
            }
            if let Some(minor) = self.minor_version {
                forge.key(e.minor_version, 0)?;
                forge.int(minor)?;
            }
            if let Some(micro) = self.micro_version {
                forge.key(e.micro_version, 0)?;
                forge.int(micro)?;
            }
            if let Some(state) = &self.state {
                forge.key(e.state, 0)?;
                forge.atom(state.as_atom())?;
            }
            forge.pop(frame)?;
            forge.offset()
        };
        buf.truncate(len);
        Ok(buf)
    }

    /// Decodes a blob. Only a blob that is not a state object at all is an
    /// error; bad fields are logged and left out.
    pub fn decode(bytes: &[u8], uris: &Uris) -> Result<Self> {
        let e = uris.engine;
        let object = AtomRef::parse(bytes)
            .filter(|a| a.urid == uris.atom.object)
            .ok_or_else(|| Error::State("blob is not an object atom".into()))?;
        match object.object_header() {
            Some(header) if header.otype == e.state => {}
            _ => return Err(Error::State("object is not a script state".into())),
        }

        let int = |key| {
            let value = object.property(key)?;
            if value.urid != uris.atom.int {
                log::warn!("state: ignoring version field of type {}", value.urid);
                return None;
            }
            value.as_i32()
        };

        let code = object.property(e.code).and_then(|value| {
            if value.urid != uris.atom.string {
                log::warn!("state: ignoring code field of type {}", value.urid);
                return None;
            }
            let text = value.as_str();
            if text.is_none() {
                log::warn!("state: ignoring code that is not valid UTF-8");
            }
            text.map(str::to_owned)
        });

        Ok(Self {
            code,
            minor_version: int(e.minor_version),
            micro_version: int(e.micro_version),
            state: object.property(e.state).map(AtomBuf::from_atom),
        })
    }
}
