/// `forge/osc.rs` — OSC bundles and messages as atoms
///
/// Messages are `osc:Message` objects holding a path string and an argument
/// tuple. Bundles are `osc:Bundle` objects holding a timetag object and an
/// item tuple. Timetag `1` means "immediately".
use super::{Forge, ForgeResult, FrameRef};
use crate::atom::Urid;

pub const IMMEDIATE: u64 = 1;

/// One OSC argument, tagged by its type character.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OscArg<'a> {
    /// `i`
    Int(i32),
    /// `f`
    Float(f32),
    /// `s`
    String(&'a str),
    /// `S`, carried as a URID
    Symbol(Urid),
    /// `b`
    Blob(&'a [u8]),
    /// `T` / `F`
    Bool(bool),
    /// `N`
    Nil,
    /// `I`
    Impulse,
    /// `h`
    Long(i64),
    /// `d`
    Double(f64),
    /// `t`
    Timetag(u64),
    /// `m`, up to four MIDI bytes
    Midi(&'a [u8]),
    /// `c`
    Char(char),
    /// `r`, packed `0xRRGGBBAA`
    Rgba(u32),
}

impl Forge<'_> {
    fn timetag(&mut self, timetag: u64) -> ForgeResult<()> {
        let osc = self.uris().osc;
        let frame = self.push_object(0, osc.timetag)?;
        self.key(osc.timetag_integral, 0)?;
        self.long((timetag >> 32) as i64)?;
        self.key(osc.timetag_fraction, 0)?;
        self.long((timetag & 0xffff_ffff) as i64)?;
        self.pop(frame)
    }

    /// Opens a bundle; items are written into the returned item tuple.
    pub fn push_bundle(&mut self, timetag: u64) -> ForgeResult<[FrameRef; 2]> {
        let osc = self.uris().osc;
        let bundle = self.push_object(0, osc.bundle)?;
        self.key(osc.bundle_timetag, 0)?;
        self.timetag(timetag)?;
        self.key(osc.bundle_items, 0)?;
        let items = self.push_tuple()?;
        Ok([bundle, items])
    }

    /// Opens a message; arguments are written into the returned tuple.
    pub fn push_message(&mut self, path: &str) -> ForgeResult<[FrameRef; 2]> {
        let osc = self.uris().osc;
        let message = self.push_object(0, osc.message)?;
        self.key(osc.message_path, 0)?;
        self.string(path)?;
        self.key(osc.message_arguments, 0)?;
        let args = self.push_tuple()?;
        Ok([message, args])
    }

    pub fn osc_arg(&mut self, arg: OscArg<'_>) -> ForgeResult<()> {
        let osc = self.uris().osc;
        match arg {
            OscArg::Int(v) => self.int(v),
            OscArg::Float(v) => self.float(v),
            OscArg::String(s) => self.string(s),
            OscArg::Symbol(u) => self.urid(u),
            OscArg::Blob(b) => self.chunk(b),
            OscArg::Bool(b) => self.bool(b),
            OscArg::Nil => self.empty(osc.nil),
            OscArg::Impulse => self.empty(osc.impulse),
            OscArg::Long(v) => self.long(v),
            OscArg::Double(v) => self.double(v),
            OscArg::Timetag(t) => self.timetag(t),
            OscArg::Midi(m) => self.midi(&m[..m.len().min(4)]),
            OscArg::Char(c) => {
                let mut utf8 = [0u8; 4];
                let text = c.encode_utf8(&mut utf8);
                self.literal(text.as_bytes(), osc.char_, 0)
            }
            OscArg::Rgba(rgba) => {
                let mut hex = [0u8; 8];
                for (i, digit) in hex.iter_mut().enumerate() {
                    let nibble = (rgba >> (28 - 4 * i)) & 0xf;
                    *digit = b"0123456789abcdef"[nibble as usize];
                }
                self.literal(&hex, osc.rgba, 0)
            }
        }
    }

    /// Writes a complete message.
    pub fn message(&mut self, path: &str, args: &[OscArg<'_>]) -> ForgeResult<()> {
        let frames = self.push_message(path)?;
        for arg in args {
            self.osc_arg(*arg)?;
        }
        self.pop_frames(&frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::AtomRef;
    use crate::forge::tests::uris;
    use crate::forge::ForgeCursor;

    #[test]
    fn message_layout_has_path_and_arguments() {
        let uris = uris();
        let mut buf = vec![0u8; 512];
        let mut cursor = ForgeCursor::new();
        let mut forge = Forge::new(&mut buf, &mut cursor, &uris);
        forge
            .message(
                "/synth/freq",
                &[OscArg::Float(440.0), OscArg::Int(3), OscArg::Bool(true), OscArg::Rgba(0x11aa22ff)],
            )
            .unwrap();
        assert_eq!(forge.depth(), 0);

        let msg = AtomRef::parse(forge.written()).unwrap();
        let osc = &uris.osc;
        assert_eq!(msg.object_header().map(|h| h.otype), Some(osc.message));
        assert_eq!(msg.property(osc.message_path).and_then(|a| a.as_str()), Some("/synth/freq"));
        let args: Vec<AtomRef> = msg.property(osc.message_arguments).unwrap().tuple_items().collect();
        assert_eq!(args.len(), 4);
        assert_eq!(args[0].as_f32(), Some(440.0));
        assert_eq!(args[2].urid, uris.atom.bool_);
        assert_eq!(args[3].literal(), Some((osc.rgba, 0, &b"11aa22ff"[..])));
    }

    #[test]
    fn bundle_nests_messages_under_timetag() {
        let uris = uris();
        let mut buf = vec![0u8; 1024];
        let mut cursor = ForgeCursor::new();
        let mut forge = Forge::new(&mut buf, &mut cursor, &uris);
        let bundle = forge.push_bundle((5u64 << 32) | 7).unwrap();
        forge.message("/a", &[OscArg::Nil]).unwrap();
        forge.message("/b", &[OscArg::Char('x')]).unwrap();
        forge.pop_frames(&bundle).unwrap();

        let atom = AtomRef::parse(forge.written()).unwrap();
        let osc = &uris.osc;
        let tag = atom.property(osc.bundle_timetag).unwrap();
        assert_eq!(tag.property(osc.timetag_integral).and_then(|a| a.as_i64()), Some(5));
        assert_eq!(tag.property(osc.timetag_fraction).and_then(|a| a.as_i64()), Some(7));
        assert_eq!(atom.property(osc.bundle_items).unwrap().tuple_items().count(), 2);
    }
}
