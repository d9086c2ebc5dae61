/// `atom/urid.rs` — URI ↔ URID mapping
///
/// The host normally hands out URIDs. `UridMapper` is the seam for that;
/// `UridMap` is the in-process implementation used when no host map is
/// supplied. `Uris` resolves every identifier the engine needs once, at
/// construction, so the audio thread never maps strings.
use std::collections::HashMap;
use std::sync::Mutex;

use super::Urid;

pub trait UridMapper: Send + Sync {
    /// Returns the URID for `uri`, allocating one on first use.
    fn map(&self, uri: &str) -> Urid;
    fn unmap(&self, urid: Urid) -> Option<String>;
}

#[derive(Default)]
struct MapInner {
    by_uri: HashMap<String, Urid>,
    by_urid: Vec<String>,
}

/// Sequential in-memory map. URIDs start at 1.
#[derive(Default)]
pub struct UridMap {
    inner: Mutex<MapInner>,
}

impl UridMap {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UridMapper for UridMap {
    fn map(&self, uri: &str) -> Urid {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(&urid) = inner.by_uri.get(uri) {
            return urid;
        }
        inner.by_urid.push(uri.to_string());
        let urid = inner.by_urid.len() as Urid;
        inner.by_uri.insert(uri.to_string(), urid);
        urid
    }

    fn unmap(&self, urid: Urid) -> Option<String> {
        let inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let idx = (urid as usize).checked_sub(1)?;
        inner.by_urid.get(idx).cloned()
    }
}

// ── Namespaces ───────────────────────────────────────────────────────────────

pub mod ns {
    pub const ATOM: &str = "http://lv2plug.in/ns/ext/atom#";
    pub const PATCH: &str = "http://lv2plug.in/ns/ext/patch#";
    pub const MIDI: &str = "http://lv2plug.in/ns/ext/midi#";
    pub const TIME: &str = "http://lv2plug.in/ns/ext/time#";
    pub const CORE: &str = "http://lv2plug.in/ns/lv2core#";
    pub const OSC: &str = "http://open-music-kontrollers.ch/lv2/osc#";
    pub const LUNATOM: &str = "urn:lunatom#";
    pub const RDF: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#";
    pub const RDFS: &str = "http://www.w3.org/2000/01/rdf-schema#";
}

fn map_in(mapper: &dyn UridMapper, prefix: &str, name: &str) -> Urid {
    let mut uri = String::with_capacity(prefix.len() + name.len());
    uri.push_str(prefix);
    uri.push_str(name);
    mapper.map(&uri)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomUris {
    pub bool_: Urid,
    pub int: Urid,
    pub long: Urid,
    pub float: Urid,
    pub double: Urid,
    pub urid: Urid,
    pub string: Urid,
    pub uri: Urid,
    pub path: Urid,
    pub literal: Urid,
    pub chunk: Urid,
    pub tuple: Urid,
    pub object: Urid,
    pub property: Urid,
    pub vector: Urid,
    pub sequence: Urid,
    pub frame_time: Urid,
    pub beat_time: Urid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchUris {
    pub get: Urid,
    pub set: Urid,
    pub put: Urid,
    pub patch: Urid,
    pub ack: Urid,
    pub error: Urid,
    pub delete: Urid,
    pub copy: Urid,
    pub move_: Urid,
    pub insert: Urid,
    pub subject: Urid,
    pub property: Urid,
    pub value: Urid,
    pub body: Urid,
    pub add: Urid,
    pub remove: Urid,
    pub sequence_number: Urid,
    pub destination: Urid,
    pub wildcard: Urid,
    pub writable: Urid,
    pub readable: Urid,
    pub self_: Urid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OscUris {
    pub bundle: Urid,
    pub message: Urid,
    pub timetag: Urid,
    pub bundle_timetag: Urid,
    pub bundle_items: Urid,
    pub message_path: Urid,
    pub message_arguments: Urid,
    pub timetag_integral: Urid,
    pub timetag_fraction: Urid,
    pub nil: Urid,
    pub impulse: Urid,
    pub char_: Urid,
    pub rgba: Urid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeUris {
    pub position: Urid,
    pub bar: Urid,
    pub bar_beat: Urid,
    pub beat: Urid,
    pub beat_unit: Urid,
    pub beats_per_bar: Urid,
    pub beats_per_minute: Urid,
    pub frame: Urid,
    pub frames_per_second: Urid,
    pub speed: Urid,
}

/// Keys of a parameter description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterUris {
    pub value: Urid,
    pub label: Urid,
    pub range: Urid,
    pub comment: Urid,
    pub child_type: Urid,
    pub minimum: Urid,
    pub maximum: Urid,
}

/// Engine-owned properties on the control/notify ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineUris {
    pub code: Urid,
    pub error: Urid,
    pub trace: Urid,
    pub state: Urid,
    pub minor_version: Urid,
    pub micro_version: Urid,
}

/// Every URID the engine uses, resolved once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uris {
    pub atom: AtomUris,
    pub patch: PatchUris,
    pub midi_event: Urid,
    pub osc: OscUris,
    pub time: TimeUris,
    pub param: ParameterUris,
    pub engine: EngineUris,
}

impl Uris {
    pub fn new(mapper: &dyn UridMapper) -> Self {
        let a = |n: &str| map_in(mapper, ns::ATOM, n);
        let atom = AtomUris {
            bool_: a("Bool"),
            int: a("Int"),
            long: a("Long"),
            float: a("Float"),
            double: a("Double"),
            urid: a("URID"),
            string: a("String"),
            uri: a("URI"),
            path: a("Path"),
            literal: a("Literal"),
            chunk: a("Chunk"),
            tuple: a("Tuple"),
            object: a("Object"),
            property: a("Property"),
            vector: a("Vector"),
            sequence: a("Sequence"),
            frame_time: a("frameTime"),
            beat_time: a("beatTime"),
        };

        let p = |n: &str| map_in(mapper, ns::PATCH, n);
        let patch = PatchUris {
            get: p("Get"),
            set: p("Set"),
            put: p("Put"),
            patch: p("Patch"),
            ack: p("Ack"),
            error: p("Error"),
            delete: p("Delete"),
            copy: p("Copy"),
            move_: p("Move"),
            insert: p("Insert"),
            subject: p("subject"),
            property: p("property"),
            value: p("value"),
            body: p("body"),
            add: p("add"),
            remove: p("remove"),
            sequence_number: p("sequenceNumber"),
            destination: p("destination"),
            wildcard: p("wildcard"),
            writable: p("writable"),
            readable: p("readable"),
            self_: p("self"),
        };

        let o = |n: &str| map_in(mapper, ns::OSC, n);
        let osc = OscUris {
            bundle: o("Bundle"),
            message: o("Message"),
            timetag: o("Timetag"),
            bundle_timetag: o("bundleTimetag"),
            bundle_items: o("bundleItems"),
            message_path: o("messagePath"),
            message_arguments: o("messageArguments"),
            timetag_integral: o("timetagIntegral"),
            timetag_fraction: o("timetagFraction"),
            nil: o("Nil"),
            impulse: o("Impulse"),
            char_: o("Char"),
            rgba: o("RGBA"),
        };

        let t = |n: &str| map_in(mapper, ns::TIME, n);
        let time = TimeUris {
            position: t("Position"),
            bar: t("bar"),
            bar_beat: t("barBeat"),
            beat: t("beat"),
            beat_unit: t("beatUnit"),
            beats_per_bar: t("beatsPerBar"),
            beats_per_minute: t("beatsPerMinute"),
            frame: t("frame"),
            frames_per_second: t("framesPerSecond"),
            speed: t("speed"),
        };

        let param = ParameterUris {
            value: map_in(mapper, ns::RDF, "value"),
            label: map_in(mapper, ns::RDFS, "label"),
            range: map_in(mapper, ns::RDFS, "range"),
            comment: map_in(mapper, ns::RDFS, "comment"),
            child_type: map_in(mapper, ns::ATOM, "childType"),
            minimum: map_in(mapper, ns::CORE, "minimum"),
            maximum: map_in(mapper, ns::CORE, "maximum"),
        };

        let engine = EngineUris {
            code: map_in(mapper, ns::LUNATOM, "code"),
            error: map_in(mapper, ns::LUNATOM, "error"),
            trace: map_in(mapper, ns::LUNATOM, "trace"),
            state: map_in(mapper, ns::LUNATOM, "state"),
            minor_version: map_in(mapper, ns::CORE, "minorVersion"),
            micro_version: map_in(mapper, ns::CORE, "microVersion"),
        };

        Self {
            atom,
            patch,
            midi_event: map_in(mapper, ns::MIDI, "MidiEvent"),
            osc,
            time,
            param,
            engine,
        }
    }
}
