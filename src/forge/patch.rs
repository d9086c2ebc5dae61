/// `forge/patch.rs` — Property-patch vocabulary
///
/// Canned object shapes for querying and mutating named properties:
/// get, set, put, patch (+ add/remove), ack, error, delete, copy, move and
/// insert. Builders that leave a value or body to the caller return the
/// frames they opened; close them with `pop_frames`.
use super::{Forge, ForgeError, ForgeResult, FrameRef};
use crate::atom::Urid;

impl Forge<'_> {
    fn patch_head(&mut self, otype: Urid, subject: Option<Urid>, seq: Option<i32>) -> ForgeResult<FrameRef> {
        let patch = self.uris().patch;
        let frame = self.push_object(0, otype)?;
        if let Some(subject) = subject {
            self.key(patch.subject, 0)?;
            self.urid(subject)?;
        }
        if let Some(seq) = seq {
            self.key(patch.sequence_number, 0)?;
            self.int(seq)?;
        }
        Ok(frame)
    }

    /// Closes `frames` innermost first. They must be exactly the innermost
    /// open frames, outermost first in the slice; otherwise nothing is closed.
    pub fn pop_frames(&mut self, frames: &[FrameRef]) -> ForgeResult<()> {
        let base = self
            .cursor
            .depth
            .checked_sub(frames.len())
            .ok_or(ForgeError::FrameMismatch)?;
        let innermost = frames
            .iter()
            .enumerate()
            .all(|(i, frame)| self.cursor.frame(base + i) == Some(*frame));
        if !innermost {
            return Err(ForgeError::FrameMismatch);
        }
        for frame in frames.iter().rev() {
            self.pop(*frame)?;
        }
        Ok(())
    }

    /// `patch:Get`, optionally for a single property.
    pub fn get(&mut self, subject: Option<Urid>, seq: Option<i32>, property: Option<Urid>) -> ForgeResult<()> {
        let get = self.uris().patch.get;
        let key = self.uris().patch.property;
        let frame = self.patch_head(get, subject, seq)?;
        if let Some(property) = property {
            self.key(key, 0)?;
            self.urid(property)?;
        }
        self.pop(frame)
    }

    /// `patch:Set`; leaves the object open right after the `patch:value` key.
    pub fn set(&mut self, subject: Option<Urid>, seq: Option<i32>, property: Urid) -> ForgeResult<FrameRef> {
        let value = self.uris().patch.value;
        let frame = self.set_property(subject, seq, property)?;
        self.key(value, 0)?;
        Ok(frame)
    }

    /// `patch:Set` up to its property; the object is left open and the
    /// caller decides whether a `patch:value` follows.
    pub fn set_property(&mut self, subject: Option<Urid>, seq: Option<i32>, property: Urid) -> ForgeResult<FrameRef> {
        let patch = self.uris().patch;
        let frame = self.patch_head(patch.set, subject, seq)?;
        self.key(patch.property, 0)?;
        self.urid(property)?;
        Ok(frame)
    }

    /// `patch:Put`; returns `[put, body]` with the body object open.
    pub fn put(&mut self, subject: Option<Urid>, seq: Option<i32>) -> ForgeResult<[FrameRef; 2]> {
        let patch = self.uris().patch;
        let outer = self.patch_head(patch.put, subject, seq)?;
        self.key(patch.body, 0)?;
        let body = self.push_object(0, 0)?;
        Ok([outer, body])
    }

    /// `patch:Patch`; the caller adds `patch_remove` / `patch_add` bodies.
    pub fn patch(&mut self, subject: Option<Urid>, seq: Option<i32>) -> ForgeResult<FrameRef> {
        let otype = self.uris().patch.patch;
        self.patch_head(otype, subject, seq)
    }

    /// `patch:remove` body inside an open patch.
    pub fn patch_remove(&mut self) -> ForgeResult<FrameRef> {
        let key = self.uris().patch.remove;
        self.key(key, 0)?;
        self.push_object(0, 0)
    }

    /// `patch:add` body inside an open patch.
    pub fn patch_add(&mut self) -> ForgeResult<FrameRef> {
        let key = self.uris().patch.add;
        self.key(key, 0)?;
        self.push_object(0, 0)
    }

    pub fn ack(&mut self, subject: Option<Urid>, seq: Option<i32>) -> ForgeResult<()> {
        let otype = self.uris().patch.ack;
        let frame = self.patch_head(otype, subject, seq)?;
        self.pop(frame)
    }

    pub fn error(&mut self, subject: Option<Urid>, seq: Option<i32>) -> ForgeResult<()> {
        let otype = self.uris().patch.error;
        let frame = self.patch_head(otype, subject, seq)?;
        self.pop(frame)
    }

    pub fn delete(&mut self, subject: Urid, seq: Option<i32>) -> ForgeResult<()> {
        let otype = self.uris().patch.delete;
        let frame = self.patch_head(otype, Some(subject), seq)?;
        self.pop(frame)
    }

    fn relocate(&mut self, otype: Urid, subject: Urid, seq: Option<i32>, destination: Urid) -> ForgeResult<()> {
        let key = self.uris().patch.destination;
        let frame = self.patch_head(otype, Some(subject), seq)?;
        self.key(key, 0)?;
        self.urid(destination)?;
        self.pop(frame)
    }

    pub fn copy(&mut self, subject: Urid, seq: Option<i32>, destination: Urid) -> ForgeResult<()> {
        let otype = self.uris().patch.copy;
        self.relocate(otype, subject, seq, destination)
    }

    pub fn move_to(&mut self, subject: Urid, seq: Option<i32>, destination: Urid) -> ForgeResult<()> {
        let otype = self.uris().patch.move_;
        self.relocate(otype, subject, seq, destination)
    }

    /// `patch:Insert`; returns `[insert, body]` with the body object open.
    pub fn insert(&mut self, subject: Option<Urid>, seq: Option<i32>) -> ForgeResult<[FrameRef; 2]> {
        let patch = self.uris().patch;
        let outer = self.patch_head(patch.insert, subject, seq)?;
        self.key(patch.body, 0)?;
        let body = self.push_object(0, 0)?;
        Ok([outer, body])
    }
}

#[cfg(test)]
mod tests {
    use crate::atom::AtomRef;
    use crate::forge::tests::uris;
    use crate::forge::{Forge, ForgeCursor, ForgeError};

    #[test]
    fn set_leaves_value_to_the_caller() {
        let uris = uris();
        let mut buf = vec![0u8; 256];
        let mut cursor = ForgeCursor::new();
        let mut forge = Forge::new(&mut buf, &mut cursor, &uris);
        let frame = forge.set(Some(100), Some(7), 200).unwrap();
        forge.float(1.5).unwrap();
        forge.pop(frame).unwrap();

        let obj = AtomRef::parse(forge.written()).unwrap();
        let p = &uris.patch;
        assert_eq!(obj.object_header().map(|h| h.otype), Some(p.set));
        assert_eq!(obj.property(p.subject).and_then(|a| a.as_u32()), Some(100));
        assert_eq!(obj.property(p.sequence_number).and_then(|a| a.as_i32()), Some(7));
        assert_eq!(obj.property(p.property).and_then(|a| a.as_u32()), Some(200));
        assert_eq!(obj.property(p.value).and_then(|a| a.as_f32()), Some(1.5));
    }

    #[test]
    fn pop_frames_closes_nothing_unless_all_are_innermost() {
        let uris = uris();
        let mut buf = vec![0u8; 256];
        let mut cursor = ForgeCursor::new();
        let mut forge = Forge::new(&mut buf, &mut cursor, &uris);
        let outer = forge.push_tuple().unwrap();
        let put = forge.put(None, None).unwrap();
        let inner = forge.push_tuple().unwrap();

        assert_eq!(forge.pop_frames(&put), Err(ForgeError::FrameMismatch));
        assert_eq!(forge.pop_frames(&[outer, inner]), Err(ForgeError::FrameMismatch));
        assert_eq!(forge.depth(), 4);

        forge.pop(inner).unwrap();
        forge.pop_frames(&put).unwrap();
        forge.pop(outer).unwrap();
        assert_eq!(forge.depth(), 0);
        let tuple = AtomRef::parse(forge.written()).unwrap();
        assert_eq!(tuple.total_size(), forge.written().len());
    }

    #[test]
    fn put_opens_two_frames() {
        let uris = uris();
        let mut buf = vec![0u8; 256];
        let mut cursor = ForgeCursor::new();
        let mut forge = Forge::new(&mut buf, &mut cursor, &uris);
        let frames = forge.put(None, None).unwrap();
        assert_eq!(forge.depth(), 2);
        forge.key(300, 0).unwrap();
        forge.int(4).unwrap();
        assert_eq!(forge.pop(frames[0]), Err(ForgeError::FrameMismatch));
        forge.pop_frames(&frames).unwrap();
        assert_eq!(forge.depth(), 0);

        let obj = AtomRef::parse(forge.written()).unwrap();
        let body = obj.property(uris.patch.body).unwrap();
        assert_eq!(body.property(300).and_then(|a| a.as_i32()), Some(4));
        assert!(obj.property(uris.patch.subject).is_none());
    }

    #[test]
    fn patch_carries_remove_and_add() {
        let uris = uris();
        let mut buf = vec![0u8; 512];
        let mut cursor = ForgeCursor::new();
        let mut forge = Forge::new(&mut buf, &mut cursor, &uris);
        let patch = forge.patch(Some(1), None).unwrap();
        let remove = forge.patch_remove().unwrap();
        forge.key(10, 0).unwrap();
        forge.urid(uris.patch.wildcard).unwrap();
        forge.pop(remove).unwrap();
        let add = forge.patch_add().unwrap();
        forge.key(10, 0).unwrap();
        forge.int(5).unwrap();
        forge.pop(add).unwrap();
        forge.pop(patch).unwrap();

        let obj = AtomRef::parse(forge.written()).unwrap();
        assert_eq!(obj.object_header().map(|h| h.otype), Some(uris.patch.patch));
        let add = obj.property(uris.patch.add).unwrap();
        assert_eq!(add.property(10).and_then(|a| a.as_i32()), Some(5));
        let remove = obj.property(uris.patch.remove).unwrap();
        assert_eq!(remove.property(10).and_then(|a| a.as_u32()), Some(uris.patch.wildcard));
    }

    #[test]
    fn closed_shapes_need_no_pop() {
        let uris = uris();
        let mut buf = vec![0u8; 1024];
        let mut cursor = ForgeCursor::new();
        let mut forge = Forge::new(&mut buf, &mut cursor, &uris);
        forge.get(Some(1), Some(2), Some(3)).unwrap();
        forge.ack(Some(1), Some(2)).unwrap();
        forge.error(None, Some(3)).unwrap();
        forge.delete(4, None).unwrap();
        forge.copy(4, None, 5).unwrap();
        forge.move_to(4, Some(9), 6).unwrap();
        let frames = forge.insert(Some(4), None).unwrap();
        forge.pop_frames(&frames).unwrap();
        assert_eq!(forge.depth(), 0);

        let p = &uris.patch;
        let otypes: Vec<u32> = {
            let mut rest = forge.written();
            let mut out = Vec::new();
            while let Some(atom) = AtomRef::parse(rest) {
                out.push(atom.object_header().map_or(0, |h| h.otype));
                rest = &rest[crate::atom::pad_size(atom.total_size())..];
            }
            out
        };
        assert_eq!(otypes, vec![p.get, p.ack, p.error, p.delete, p.copy, p.move_, p.insert]);
    }

    #[test]
    fn overflow_mid_shape_reports_overflow() {
        let uris = uris();
        let mut buf = vec![0u8; 40];
        let mut cursor = ForgeCursor::new();
        let mut forge = Forge::new(&mut buf, &mut cursor, &uris);
        assert_eq!(forge.get(Some(1), Some(2), Some(3)), Err(ForgeError::Overflow));
    }
}
