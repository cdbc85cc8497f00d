//!
//! # Variable Decoding & Encoding
//!
//! Variables are self-describing: a key index into the library's name table,
//! a word of type-and-flag bits, an optional text descriptor, and a payload
//! whose shape depends on the type bits.
//!
//! Decoding happens in two steps. [read_vars] produces [RawVariable]s,
//! whose references are still on-disk indices. Once every cell is known,
//! including those of other libraries, [ElibParser::fix_vars] converts them into [Variable]s.
//!

// Crates.io
use log::trace;

// Local Imports
use crate::codec::ElibReader;
use crate::data::{
    Diagnostic, ElibError, ElibResult, InstRef, NodeProto, PortRef, TextDescriptor, VarValue,
    Variable,
};
use crate::header::VersionFlags;
use crate::read::ElibParser;
use crate::resolve::soft_error;

/// # Variable Type Bits
pub mod vtype {
    pub const VUNKNOWN: i32 = 0o0;
    pub const VINTEGER: i32 = 0o1;
    pub const VADDRESS: i32 = 0o2;
    pub const VCHAR: i32 = 0o3;
    pub const VSTRING: i32 = 0o4;
    pub const VFLOAT: i32 = 0o5;
    pub const VDOUBLE: i32 = 0o6;
    pub const VNODEINST: i32 = 0o7;
    pub const VNODEPROTO: i32 = 0o10;
    pub const VPORTARCINST: i32 = 0o11;
    pub const VPORTEXPINST: i32 = 0o12;
    pub const VPORTPROTO: i32 = 0o13;
    pub const VARCINST: i32 = 0o14;
    pub const VARCPROTO: i32 = 0o15;
    pub const VGEOM: i32 = 0o16;
    pub const VLIBRARY: i32 = 0o17;
    pub const VTECHNOLOGY: i32 = 0o20;
    pub const VTOOL: i32 = 0o21;
    pub const VRTNODE: i32 = 0o22;
    pub const VFRACT: i32 = 0o23;
    pub const VNETWORK: i32 = 0o24;
    pub const VVIEW: i32 = 0o26;
    pub const VWINDOWPART: i32 = 0o27;
    pub const VGRAPHICS: i32 = 0o30;
    pub const VSHORT: i32 = 0o31;
    pub const VCONSTRAINT: i32 = 0o32;
    pub const VGENERAL: i32 = 0o33;
    pub const VWINDOWFRAME: i32 = 0o34;
    pub const VPOLYGON: i32 = 0o35;
    pub const VBOOLEAN: i32 = 0o36;
    /// Mask of the type tag
    pub const VTYPE: i32 = 0o37;
    pub const VCODE1: i32 = 0o40;
    pub const VDISPLAY: i32 = 0o100;
    pub const VISARRAY: i32 = 0o200;
    /// Mask of the embedded array length
    pub const VLENGTH: i32 = 0o3777777000;
    pub const VLENGTHSH: i32 = 9;
    pub const VCODE2: i32 = 0o4000000000u32 as i32;
}
use vtype::*;

/// Variable value, with references still in on-disk index form
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RawValue {
    /// Consumed legacy kinds, and unreadable references
    Null,
    Int(i32),
    Fract(f32),
    Float(f32),
    Double(f64),
    Short(i16),
    Byte(i8),
    Str(String),
    NodeInst(i32),
    ArcInst(i32),
    NodeProto(i32),
    ArcProto(i32),
    PortProto(i32),
    Technology(i32),
    Tool(i32),
    Library(String),
    Array(Vec<RawValue>),
}

/// Variable, with references still in on-disk index form
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RawVariable {
    pub key: String,
    pub flags: i32,
    pub descriptor: Option<TextDescriptor>,
    pub value: RawValue,
}
impl RawVariable {
    /// Get our value as a string, if it is one
    pub fn as_str(&self) -> Option<&str> {
        match &self.value {
            RawValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// Read a block of variables: a count, then each variable.
/// Variables with deprecated keys, or of unreadable types, are consumed and dropped.
pub(crate) fn read_vars(
    rdr: &mut ElibReader,
    names: &[String],
    flags: &VersionFlags,
    deprecated: &[String],
    diags: &mut Vec<Diagnostic>,
) -> ElibResult<Vec<RawVariable>> {
    let count = rdr.read_big()?;
    let mut vars = Vec::with_capacity(rdr.check_fits(count.max(0) as usize, 1)?);
    let has_descriptors = rdr.ctx().caps.views;
    for _ in 0..count {
        let pos = rdr.pos();
        let key = rdr.read_small()?;
        let key = match usize::try_from(key).ok().and_then(|k| names.get(k)) {
            Some(k) => k.clone(),
            None => {
                return Err(ElibError::Format {
                    msg: format!(
                        "Invalid variable name index {} (limit is {})",
                        key,
                        names.len()
                    ),
                    bytepos: pos,
                    ctx: Vec::new(),
                })
            }
        };
        let vflags = rdr.read_big()?;

        let (mut d0, mut d1) = (0, 0);
        if has_descriptors {
            if flags.always_text_descriptors {
                d0 = rdr.read_big()?;
                d1 = rdr.read_big()?;
            } else if vflags & VDISPLAY != 0 {
                d0 = rdr.read_big()?;
                if !flags.convert_text_descriptors {
                    d1 = rdr.read_big()?;
                }
            }
        }

        let value = if vflags & VISARRAY != 0 {
            let len = rdr.read_big()?;
            let len = match has_payload(vflags) {
                true => rdr.check_fits(len.max(0) as usize, 1)?,
                false => 0,
            };
            let mut items = Vec::with_capacity(len);
            if vflags & VTYPE == VGENERAL {
                for _ in (0..len).step_by(2) {
                    rdr.read_big()?;
                    rdr.read_big()?;
                    items.push(RawValue::Null);
                }
            } else {
                for _ in 0..len {
                    items.push(read_value(rdr, vflags)?);
                }
            }
            match array_supported(vflags) {
                true => RawValue::Array(items),
                false => RawValue::Null,
            }
        } else {
            read_value(rdr, vflags)?
        };

        if deprecated.iter().any(|d| *d == key) {
            trace!("Dropping deprecated variable {}", key);
            continue;
        }
        if value == RawValue::Null {
            soft_error(
                diags,
                format!("Cannot read variable {} of type {}", key, vflags & VTYPE),
            );
            continue;
        }
        vars.push(RawVariable {
            key,
            flags: vflags,
            descriptor: TextDescriptor::from_words(d0, d1),
            value,
        });
    }
    Ok(vars)
}

/// Boolean indication of whether arrays of the type in `vflags` are supported
fn array_supported(vflags: i32) -> bool {
    matches!(
        vflags & VTYPE,
        VADDRESS
            | VINTEGER
            | VFRACT
            | VFLOAT
            | VDOUBLE
            | VSHORT
            | VBOOLEAN
            | VCHAR
            | VSTRING
            | VNODEINST
            | VARCINST
            | VNODEPROTO
            | VARCPROTO
            | VPORTPROTO
            | VTECHNOLOGY
            | VLIBRARY
            | VTOOL
    )
}

/// Element type of `vflags`. Code-bearing values are stored as strings.
fn value_type(vflags: i32) -> i32 {
    match vflags & (VCODE1 | VCODE2) {
        0 => vflags & VTYPE,
        _ => VSTRING,
    }
}

/// Boolean indication of whether values of the type in `vflags` occupy any bytes
fn has_payload(vflags: i32) -> bool {
    vflags & VTYPE == VGENERAL
        || matches!(
            value_type(vflags),
            VADDRESS
                | VINTEGER
                | VFRACT
                | VFLOAT
                | VDOUBLE
                | VSHORT
                | VBOOLEAN
                | VCHAR
                | VSTRING
                | VNODEINST
                | VNODEPROTO
                | VARCPROTO
                | VPORTPROTO
                | VARCINST
                | VTECHNOLOGY
                | VTOOL
                | VLIBRARY
                | VGEOM
                | VPORTARCINST
                | VPORTEXPINST
                | VRTNODE
        )
}

/// Read a single value of the type in `vflags`
fn read_value(rdr: &mut ElibReader, vflags: i32) -> ElibResult<RawValue> {
    let ty = value_type(vflags);
    let v = match ty {
        VADDRESS | VINTEGER => RawValue::Int(rdr.read_big()?),
        VFRACT => RawValue::Fract(rdr.read_big()? as f32 / 120.0),
        VFLOAT => RawValue::Float(rdr.read_float()?),
        VDOUBLE => RawValue::Double(rdr.read_double()?),
        VSHORT => RawValue::Short(rdr.read_small()?),
        VBOOLEAN | VCHAR => RawValue::Byte(rdr.read_byte()? as i8),
        VSTRING => RawValue::Str(rdr.read_string()?),
        VNODEINST => RawValue::NodeInst(rdr.read_big()?),
        VNODEPROTO => RawValue::NodeProto(rdr.read_big()?),
        VARCPROTO => RawValue::ArcProto(rdr.read_big()?),
        VPORTPROTO => RawValue::PortProto(rdr.read_big()?),
        VARCINST => RawValue::ArcInst(rdr.read_big()?),
        VTECHNOLOGY => RawValue::Technology(rdr.read_big()?),
        VTOOL => RawValue::Tool(rdr.read_big()?),
        VLIBRARY => RawValue::Library(rdr.read_string()?),
        VGEOM => {
            rdr.read_big()?;
            rdr.read_big()?;
            RawValue::Null
        }
        VPORTARCINST | VPORTEXPINST | VRTNODE => {
            rdr.read_big()?;
            RawValue::Null
        }
        // Types with no payload
        _ => RawValue::Null,
    };
    Ok(v)
}

/// Type bits for writing `value`. Non-type bits of `flags` are kept;
/// `flags` also breaks ties between types sharing a value representation.
pub fn type_bits(value: &VarValue, flags: i32) -> i32 {
    let keep = flags & !(VTYPE | VISARRAY | VLENGTH | VCODE1 | VCODE2);
    let tag = |v: &VarValue| -> i32 {
        match v {
            VarValue::Null => flags & VTYPE,
            VarValue::Int(_) if flags & VTYPE == VADDRESS => VADDRESS,
            VarValue::Int(_) => VINTEGER,
            VarValue::Fract(_) => VFRACT,
            VarValue::Float(_) => VFLOAT,
            VarValue::Double(_) => VDOUBLE,
            VarValue::Short(_) => VSHORT,
            VarValue::Byte(_) if flags & VTYPE == VBOOLEAN => VBOOLEAN,
            VarValue::Byte(_) => VCHAR,
            VarValue::Str(_) => VSTRING | (flags & (VCODE1 | VCODE2)),
            VarValue::NodeInst(_) => VNODEINST,
            VarValue::ArcInst(_) => VARCINST,
            VarValue::NodeProto(_) => VNODEPROTO,
            VarValue::ArcProto(_) => VARCPROTO,
            VarValue::PortProto(_) => VPORTPROTO,
            VarValue::Technology(_) => VTECHNOLOGY,
            VarValue::Tool(_) => VTOOL,
            VarValue::Library(_) => VLIBRARY,
            VarValue::Array(_) => VUNKNOWN,
        }
    };
    match value {
        VarValue::Array(items) => {
            let t = items
                .iter()
                .find(|v| **v != VarValue::Null)
                .map(tag)
                .unwrap_or(flags & VTYPE);
            let len = ((items.len() as i32) << VLENGTHSH) & VLENGTH;
            keep | t | VISARRAY | len
        }
        v => keep | tag(v),
    }
}

impl<'db> ElibParser<'db> {
    /// Convert [RawVariable]s into [Variable]s, resolving their references.
    /// Array elements which fail to resolve become [VarValue::Null];
    /// scalars which fail to resolve are dropped.
    pub(crate) fn fix_vars(&mut self, raw: Vec<RawVariable>) -> Vec<Variable> {
        let mut vars = Vec::with_capacity(raw.len());
        for rv in raw.into_iter() {
            let value = match rv.value {
                RawValue::Array(items) => {
                    VarValue::Array(items.into_iter().map(|i| self.fix_value(i)).collect())
                }
                v => self.fix_value(v),
            };
            if value == VarValue::Null {
                let msg = format!("Variable {} refers to an unknown object", rv.key);
                soft_error(&mut self.diagnostics, msg);
                continue;
            }
            vars.push(Variable {
                key: rv.key,
                flags: rv.flags,
                descriptor: rv.descriptor,
                value,
            });
        }
        vars
    }
    /// Convert a single [RawValue]
    fn fix_value(&mut self, raw: RawValue) -> VarValue {
        let diags = &mut self.diagnostics;
        match raw {
            RawValue::Null => VarValue::Null,
            RawValue::Int(i) => VarValue::Int(i),
            RawValue::Fract(f) => VarValue::Fract(f),
            RawValue::Float(f) => VarValue::Float(f),
            RawValue::Double(f) => VarValue::Double(f),
            RawValue::Short(s) => VarValue::Short(s),
            RawValue::Byte(b) => VarValue::Byte(b),
            RawValue::Str(s) => VarValue::Str(s),
            RawValue::Library(s) => VarValue::Library(s),
            RawValue::NodeInst(i) => match self.inst_ref(i, true) {
                Some(r) => VarValue::NodeInst(r),
                None => VarValue::Null,
            },
            RawValue::ArcInst(i) => match self.inst_ref(i, false) {
                Some(r) => VarValue::ArcInst(r),
                None => VarValue::Null,
            },
            RawValue::NodeProto(i) => match self.node_proto(i) {
                Some(p) => VarValue::NodeProto(p),
                None => VarValue::Null,
            },
            RawValue::ArcProto(i) => match usize::try_from(-(i as i64) - 2) {
                Ok(idx) => match self.protos.arc(idx, diags) {
                    Some(a) => VarValue::ArcProto(a),
                    None => VarValue::Null,
                },
                Err(_) => VarValue::Null,
            },
            RawValue::PortProto(i) => match self.port_ref(i) {
                Some(p) => VarValue::PortProto(p),
                None => VarValue::Null,
            },
            RawValue::Technology(i) => match usize::try_from(i) {
                Ok(idx) => match self.protos.tech(idx, diags) {
                    Some(t) => VarValue::Technology(t),
                    None => VarValue::Null,
                },
                Err(_) => VarValue::Null,
            },
            RawValue::Tool(i) => {
                let idx = match usize::try_from(i) {
                    Ok(idx) if idx < self.protos.num_tools() => idx,
                    _ => return VarValue::Null,
                };
                let tool = self.protos.tool(idx, diags).unwrap_or(0);
                match self.db.registry.tools.get(tool) {
                    Some(t) => VarValue::Tool(t.name.clone()),
                    None => VarValue::Null,
                }
            }
            RawValue::Array(_) => VarValue::Null,
        }
    }
    /// Resolve global node (or arc, if not `node`) index `i` to an [InstRef] in a local cell
    fn inst_ref(&self, i: i32, node: bool) -> Option<InstRef> {
        let i = usize::try_from(i).ok()?;
        let (cell, index) = match node {
            true => self.tables.node_owner(i)?,
            false => self.tables.arc_owner(i)?,
        };
        let cell = (*self.cell_refs.get(cell)?)?;
        Some(InstRef { cell, index })
    }
    /// Resolve an on-disk node-prototype index.
    /// Negative values are primitives, offset by two; minus one is "none".
    pub(crate) fn node_proto(&mut self, i: i32) -> Option<NodeProto> {
        match i {
            -1 => None,
            i if i < 0 => {
                let idx = usize::try_from(-(i as i64) - 2).ok()?;
                self.protos
                    .node(idx, &mut self.diagnostics)
                    .map(NodeProto::Primitive)
            }
            i => {
                let cref = (*self.cell_refs.get(i as usize)?)?;
                Some(NodeProto::Cell(cref))
            }
        }
    }
    /// Resolve an on-disk port-prototype index.
    /// Negative values are primitive ports, offset by two; others are exports.
    pub(crate) fn port_ref(&mut self, i: i32) -> Option<PortRef> {
        if i < 0 {
            let idx = usize::try_from(-(i as i64) - 2).ok()?;
            return self
                .protos
                .port(idx, &mut self.diagnostics)
                .map(PortRef::Primitive);
        }
        let (cell, _) = self.tables.export_owner(i as usize)?;
        let cref = (*self.cell_refs.get(cell)?)?;
        let name = self.export_name(i as usize)?.to_string();
        Some(PortRef::Export { cell: cref, name })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::Magic;

    /// Big-endian revision-twelve stream, with `body` following the header
    fn reader(body: &[u8]) -> ElibReader {
        let mut bytes = Magic::Magic12.value().to_be_bytes().to_vec();
        bytes.extend_from_slice(&[2, 4, 1]);
        bytes.extend_from_slice(body);
        let mut rdr = ElibReader::from_bytes(bytes);
        rdr.read_header().unwrap();
        rdr
    }
    fn big(v: i32) -> Vec<u8> {
        v.to_be_bytes().to_vec()
    }
    fn small(v: i16) -> Vec<u8> {
        v.to_be_bytes().to_vec()
    }

    #[test]
    fn decodes_scalars_and_arrays() {
        let names = vec!["a".to_string(), "b".to_string(), "old".to_string()];
        let flags = VersionFlags {
            always_text_descriptors: true,
            ..Default::default()
        };
        let mut body = big(4);
        // a: fract 240 -> 2.0, with a descriptor
        body.extend(small(0));
        body.extend(big(VFRACT | VDISPLAY));
        body.extend(big(7));
        body.extend(big(8));
        body.extend(big(240));
        // b: array of three shorts
        body.extend(small(1));
        body.extend(big(VSHORT | VISARRAY));
        body.extend(big(0));
        body.extend(big(0));
        body.extend(big(3));
        for s in [1i16, -2, 3] {
            body.extend(small(s));
        }
        // old: deprecated string, consumed
        body.extend(small(2));
        body.extend(big(VSTRING));
        body.extend(big(0));
        body.extend(big(0));
        body.extend(big(2));
        body.extend_from_slice(b"xy");
        // a: geometry, consumed as two words and dropped
        body.extend(small(0));
        body.extend(big(VGEOM));
        body.extend(big(0));
        body.extend(big(0));
        body.extend(big(5));
        body.extend(big(6));

        let mut rdr = reader(&body);
        let mut diags = Vec::new();
        let vars = read_vars(&mut rdr, &names, &flags, &["old".to_string()], &mut diags).unwrap();
        assert_eq!(rdr.remaining(), 0);
        assert_eq!(vars.len(), 2);
        assert_eq!(vars[0].value, RawValue::Fract(2.0));
        assert_eq!(vars[0].descriptor, Some(TextDescriptor(7, 8)));
        assert_eq!(
            vars[1].value,
            RawValue::Array(vec![RawValue::Short(1), RawValue::Short(-2), RawValue::Short(3)])
        );
        assert_eq!(vars[1].descriptor, None);
        assert_eq!(diags.len(), 1);
    }
    #[test]
    fn code_bits_force_strings() {
        let names = vec!["c".to_string()];
        let mut body = big(1);
        body.extend(small(0));
        body.extend(big(VINTEGER | VCODE1));
        body.extend(big(0));
        body.extend(big(0));
        body.extend(big(3));
        body.extend_from_slice(b"1+1");
        let mut rdr = reader(&body);
        let flags = VersionFlags {
            always_text_descriptors: true,
            ..Default::default()
        };
        let vars = read_vars(&mut rdr, &names, &flags, &[], &mut Vec::new()).unwrap();
        assert_eq!(vars[0].as_str(), Some("1+1"));
    }
    #[test]
    fn rejects_bad_keys() {
        let mut body = big(1);
        body.extend(small(5));
        let mut rdr = reader(&body);
        let r = read_vars(&mut rdr, &[], &VersionFlags::default(), &[], &mut Vec::new());
        assert!(matches!(r, Err(ElibError::Format { .. })));
    }
    #[test]
    fn descriptor_eras() {
        // Displayable variables in single-word descriptor files carry one word
        let names = vec!["d".to_string()];
        let mut body = big(1);
        body.extend(small(0));
        body.extend(big(VINTEGER | VDISPLAY));
        body.extend(big(9));
        body.extend(big(42));
        let flags = VersionFlags {
            convert_text_descriptors: true,
            ..Default::default()
        };
        let mut rdr = reader(&body);
        let vars = read_vars(&mut rdr, &names, &flags, &[], &mut Vec::new()).unwrap();
        assert_eq!(vars[0].value, RawValue::Int(42));
        assert_eq!(vars[0].descriptor, Some(TextDescriptor(9, 0)));
        assert_eq!(rdr.remaining(), 0);
    }
    #[test]
    fn write_type_bits() {
        assert_eq!(type_bits(&VarValue::Int(3), VADDRESS | VDISPLAY), VADDRESS | VDISPLAY);
        assert_eq!(type_bits(&VarValue::Int(3), VSTRING), VINTEGER);
        assert_eq!(type_bits(&VarValue::Str("s".into()), VINTEGER | VCODE1), VSTRING | VCODE1);
        let arr = VarValue::Array(vec![VarValue::Null, VarValue::Double(1.0)]);
        assert_eq!(type_bits(&arr, 0), VDOUBLE | VISARRAY | (2 << VLENGTHSH));
    }
}
