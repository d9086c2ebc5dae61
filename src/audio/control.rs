/// `audio/control.rs` — Control and notify ports
///
/// The control port carries property-patch messages from the UI: `patch:Get`
/// asks for the script text and the last error, `patch:Set` of the code
/// property submits new script text. Replies and script output leave on the
/// notify port as `patch:Set` messages of the code, error and trace
/// properties.
use crate::atom::urid::Uris;
use crate::atom::{AtomRef, TimeStamp, Urid};
use crate::forge::{Forge, ForgeResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest<'a> {
    /// `None` asks for every property.
    Get(Option<Urid>),
    SetCode(&'a str),
}

/// Interprets one control event. Anything that is not a request this engine
/// answers yields `None`.
pub fn parse<'a>(atom: AtomRef<'a>, uris: &Uris) -> Option<ControlRequest<'a>> {
    if atom.urid != uris.atom.object {
        return None;
    }
    let header = atom.object_header()?;
    let property = atom
        .property(uris.patch.property)
        .filter(|p| p.urid == uris.atom.urid)
        .and_then(|p| p.as_u32());

    if header.otype == uris.patch.get {
        return match property {
            None => Some(ControlRequest::Get(None)),
            Some(p) if p == uris.engine.code || p == uris.engine.error => Some(ControlRequest::Get(Some(p))),
            Some(_) => None,
        };
    }
    if header.otype == uris.patch.set && property == Some(uris.engine.code) {
        let value = atom.property(uris.patch.value)?;
        if value.urid != uris.atom.string {
            return None;
        }
        return value.as_str().map(ControlRequest::SetCode);
    }
    None
}

/// Which properties the next notify block must report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pending {
    pub code: bool,
    pub error: bool,
}

impl Pending {
    pub fn request(&mut self, property: Option<Urid>, uris: &Uris) {
        match property {
            None => {
                self.code = true;
                self.error = true;
            }
            Some(p) if p == uris.engine.code => self.code = true,
            Some(_) => self.error = true,
        }
    }

    pub fn any(&self) -> bool {
        self.code || self.error
    }
}

/// Appends `patch:Set <property> = "<text>"` at `frames`.
pub fn set_text(forge: &mut Forge<'_>, frames: i64, property: Urid, text: &str) -> ForgeResult<()> {
    forge.time(TimeStamp::Frames(frames))?;
    let frame = forge.set(None, None, property)?;
    forge.string(text)?;
    forge.pop(frame)
}
