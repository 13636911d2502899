/*
 * Copyright 2024 Oxide Computer Company
 */

/*!
 * Attribute sets: the typed name/value maps handed across every public
 * interface in this crate.  Discovery results, instantiation requests and
 * the CLI wire format are all attribute sets; no ad-hoc structs cross a
 * component boundary.
 */

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttrError {
    #[error("attribute \"{0}\" not found")]
    NotFound(String),
    #[error("attribute \"{name}\" holds {have}, not {want}")]
    TypeMismatch { name: String, want: AttrKind, have: AttrKind },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrKind {
    Boolean,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Text,
    BooleanArray,
    Uint8Array,
    Uint16Array,
    Uint32Array,
    Uint64Array,
    TextArray,
    Set,
    SetArray,
}

impl fmt::Display for AttrKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let n = match self {
            AttrKind::Boolean => "boolean",
            AttrKind::Uint8 => "uint8",
            AttrKind::Uint16 => "uint16",
            AttrKind::Uint32 => "uint32",
            AttrKind::Uint64 => "uint64",
            AttrKind::Text => "string",
            AttrKind::BooleanArray => "boolean array",
            AttrKind::Uint8Array => "uint8 array",
            AttrKind::Uint16Array => "uint16 array",
            AttrKind::Uint32Array => "uint32 array",
            AttrKind::Uint64Array => "uint64 array",
            AttrKind::TextArray => "string array",
            AttrKind::Set => "attribute set",
            AttrKind::SetArray => "attribute set array",
        };
        f.write_str(n)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttrValue {
    Boolean(bool),
    Uint8(u8),
    Uint16(u16),
    Uint32(u32),
    Uint64(u64),
    Text(String),
    BooleanArray(Vec<bool>),
    Uint8Array(Vec<u8>),
    Uint16Array(Vec<u16>),
    Uint32Array(Vec<u32>),
    Uint64Array(Vec<u64>),
    TextArray(Vec<String>),
    Set(AttrSet),
    SetArray(Vec<AttrSet>),
}

impl AttrValue {
    pub fn kind(&self) -> AttrKind {
        match self {
            AttrValue::Boolean(_) => AttrKind::Boolean,
            AttrValue::Uint8(_) => AttrKind::Uint8,
            AttrValue::Uint16(_) => AttrKind::Uint16,
            AttrValue::Uint32(_) => AttrKind::Uint32,
            AttrValue::Uint64(_) => AttrKind::Uint64,
            AttrValue::Text(_) => AttrKind::Text,
            AttrValue::BooleanArray(_) => AttrKind::BooleanArray,
            AttrValue::Uint8Array(_) => AttrKind::Uint8Array,
            AttrValue::Uint16Array(_) => AttrKind::Uint16Array,
            AttrValue::Uint32Array(_) => AttrKind::Uint32Array,
            AttrValue::Uint64Array(_) => AttrKind::Uint64Array,
            AttrValue::TextArray(_) => AttrKind::TextArray,
            AttrValue::Set(_) => AttrKind::Set,
            AttrValue::SetArray(_) => AttrKind::SetArray,
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fn list<T: fmt::Display>(f: &mut fmt::Formatter, vs: &[T])
            -> fmt::Result
        {
            write!(f, "[")?;
            for (i, v) in vs.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", v)?;
            }
            write!(f, "]")
        }

        match self {
            AttrValue::Boolean(v) => write!(f, "{}", v),
            AttrValue::Uint8(v) => write!(f, "{}", v),
            AttrValue::Uint16(v) => write!(f, "{}", v),
            AttrValue::Uint32(v) => write!(f, "{}", v),
            AttrValue::Uint64(v) => write!(f, "{}", v),
            AttrValue::Text(v) => write!(f, "\"{}\"", v),
            AttrValue::BooleanArray(v) => list(f, v),
            AttrValue::Uint8Array(v) => list(f, v),
            AttrValue::Uint16Array(v) => list(f, v),
            AttrValue::Uint32Array(v) => list(f, v),
            AttrValue::Uint64Array(v) => list(f, v),
            AttrValue::TextArray(v) => {
                write!(f, "[")?;
                for (i, s) in v.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "\"{}\"", s)?;
                }
                write!(f, "]")
            }
            AttrValue::Set(v) => write!(f, "{}", v),
            AttrValue::SetArray(v) => list(f, v),
        }
    }
}

/**
 * A mapping of short ASCII names to typed values.  Names are unique
 * within a set; the set owns its values and lookups borrow from the set.
 * Adding a name that already exists with the same kind is silently
 * ignored, preserving the original value; adding it with a different kind
 * is a type mismatch.
 */
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttrSet {
    attrs: BTreeMap<String, AttrValue>,
}

macro_rules! scalar_attr {
    ($add:ident, $get:ident, $variant:ident, $t:ty) => {
        pub fn $add(&mut self, name: &str, v: $t) -> Result<(), AttrError> {
            self.add_value(name, AttrValue::$variant(v))
        }

        pub fn $get(&self, name: &str) -> Result<$t, AttrError> {
            match self.get_value(name, AttrKind::$variant)? {
                AttrValue::$variant(v) => Ok(*v),
                _ => panic!("kind checked by get_value"),
            }
        }
    };
}

macro_rules! array_attr {
    ($add:ident, $get:ident, $variant:ident, $t:ty) => {
        pub fn $add(&mut self, name: &str, v: Vec<$t>)
            -> Result<(), AttrError>
        {
            self.add_value(name, AttrValue::$variant(v))
        }

        pub fn $get(&self, name: &str) -> Result<&[$t], AttrError> {
            match self.get_value(name, AttrKind::$variant)? {
                AttrValue::$variant(v) => Ok(v.as_slice()),
                _ => panic!("kind checked by get_value"),
            }
        }
    };
}

impl AttrSet {
    pub fn new() -> AttrSet {
        AttrSet::default()
    }

    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.attrs.contains_key(name)
    }

    pub fn kind_of(&self, name: &str) -> Option<AttrKind> {
        self.attrs.get(name).map(AttrValue::kind)
    }

    /**
     * Yield (name, kind) pairs.  The order is not part of the contract.
     */
    pub fn iter(&self) -> impl Iterator<Item = (&str, AttrKind)> {
        self.attrs.iter().map(|(n, v)| (n.as_str(), v.kind()))
    }

    pub fn value(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name)
    }

    fn add_value(&mut self, name: &str, v: AttrValue)
        -> Result<(), AttrError>
    {
        if let Some(old) = self.attrs.get(name) {
            if old.kind() == v.kind() {
                /*
                 * Names are unique; a duplicate of the same kind keeps the
                 * original value.
                 */
                return Ok(());
            }
            return Err(AttrError::TypeMismatch {
                name: name.to_string(),
                want: v.kind(),
                have: old.kind(),
            });
        }

        self.attrs.insert(name.to_string(), v);
        Ok(())
    }

    fn get_value(&self, name: &str, want: AttrKind)
        -> Result<&AttrValue, AttrError>
    {
        match self.attrs.get(name) {
            None => Err(AttrError::NotFound(name.to_string())),
            Some(v) if v.kind() == want => Ok(v),
            Some(v) => Err(AttrError::TypeMismatch {
                name: name.to_string(),
                want,
                have: v.kind(),
            }),
        }
    }

    scalar_attr!(add_boolean, get_boolean, Boolean, bool);
    scalar_attr!(add_uint8, get_uint8, Uint8, u8);
    scalar_attr!(add_uint16, get_uint16, Uint16, u16);
    scalar_attr!(add_uint32, get_uint32, Uint32, u32);
    scalar_attr!(add_uint64, get_uint64, Uint64, u64);

    pub fn add_text(&mut self, name: &str, v: &str) -> Result<(), AttrError> {
        self.add_value(name, AttrValue::Text(v.to_string()))
    }

    pub fn get_text(&self, name: &str) -> Result<&str, AttrError> {
        match self.get_value(name, AttrKind::Text)? {
            AttrValue::Text(v) => Ok(v.as_str()),
            _ => panic!("kind checked by get_value"),
        }
    }

    array_attr!(add_boolean_array, get_boolean_array, BooleanArray, bool);
    array_attr!(add_uint8_array, get_uint8_array, Uint8Array, u8);
    array_attr!(add_uint16_array, get_uint16_array, Uint16Array, u16);
    array_attr!(add_uint32_array, get_uint32_array, Uint32Array, u32);
    array_attr!(add_uint64_array, get_uint64_array, Uint64Array, u64);
    array_attr!(add_text_array, get_text_array, TextArray, String);

    pub fn add_set(&mut self, name: &str, v: AttrSet)
        -> Result<(), AttrError>
    {
        self.add_value(name, AttrValue::Set(v))
    }

    pub fn get_set(&self, name: &str) -> Result<&AttrSet, AttrError> {
        match self.get_value(name, AttrKind::Set)? {
            AttrValue::Set(v) => Ok(v),
            _ => panic!("kind checked by get_value"),
        }
    }

    pub fn add_set_array(&mut self, name: &str, v: Vec<AttrSet>)
        -> Result<(), AttrError>
    {
        self.add_value(name, AttrValue::SetArray(v))
    }

    pub fn get_set_array(&self, name: &str) -> Result<&[AttrSet], AttrError> {
        match self.get_value(name, AttrKind::SetArray)? {
            AttrValue::SetArray(v) => Ok(v.as_slice()),
            _ => panic!("kind checked by get_value"),
        }
    }
}

impl fmt::Display for AttrSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{ ")?;
        for (i, (n, v)) in self.attrs.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{} = {}", n, v)?;
        }
        write!(f, " }}")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn scalar_round_trip() {
        let mut a = AttrSet::new();
        a.add_uint32("disk.size-mb", 60000).unwrap();
        a.add_text("disk.name", "c0t0d0").unwrap();
        a.add_boolean("disk.is-boot-disk", true).unwrap();

        assert_eq!(a.get_uint32("disk.size-mb").unwrap(), 60000);
        assert_eq!(a.get_text("disk.name").unwrap(), "c0t0d0");
        assert!(a.get_boolean("disk.is-boot-disk").unwrap());
    }

    #[test]
    fn duplicate_same_kind_keeps_original() {
        let mut a = AttrSet::new();
        a.add_uint32("slice.index", 0).unwrap();
        a.add_uint32("slice.index", 7).unwrap();
        assert_eq!(a.get_uint32("slice.index").unwrap(), 0);
        assert_eq!(a.len(), 1);
    }

    #[test]
    fn duplicate_other_kind_is_mismatch() {
        let mut a = AttrSet::new();
        a.add_uint32("slice.index", 0).unwrap();
        let e = a.add_text("slice.index", "zero").unwrap_err();
        assert!(matches!(e, AttrError::TypeMismatch { .. }));
    }

    #[test]
    fn get_missing_is_not_found() {
        let a = AttrSet::new();
        assert_eq!(
            a.get_text("be.name").unwrap_err(),
            AttrError::NotFound("be.name".to_string())
        );
    }

    #[test]
    fn get_wrong_kind_is_mismatch() {
        let mut a = AttrSet::new();
        a.add_text("be.name", "solaris").unwrap();
        let e = a.get_uint32("be.name").unwrap_err();
        assert!(matches!(e, AttrError::TypeMismatch { .. }));
    }

    #[test]
    fn arrays_and_nested_sets() {
        let mut props = AttrSet::new();
        props
            .add_text_array(
                "zfs.prop.names",
                vec!["compression".to_string()],
            )
            .unwrap();
        props
            .add_text_array("zfs.prop.values", vec!["on".to_string()])
            .unwrap();

        let mut a = AttrSet::new();
        a.add_text_array(
            "zfs.fs.names",
            vec!["ROOT/solaris".to_string(), "export".to_string()],
        )
        .unwrap();
        a.add_set_array("zfs.fs.properties", vec![props.clone()]).unwrap();

        assert_eq!(a.get_text_array("zfs.fs.names").unwrap().len(), 2);
        let nested = &a.get_set_array("zfs.fs.properties").unwrap()[0];
        assert_eq!(
            nested.get_text_array("zfs.prop.names").unwrap(),
            &["compression".to_string()]
        );
    }

    #[test]
    fn clone_is_deep() {
        let mut inner = AttrSet::new();
        inner.add_uint8("part.id", 0xbf).unwrap();
        let mut a = AttrSet::new();
        a.add_set("nested", inner).unwrap();

        let b = a.clone();
        assert_eq!(a, b);
        /*
         * Mutating the clone must not affect the original.
         */
        let mut b = b;
        b.add_text("extra", "x").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn iterate_yields_name_and_kind() {
        let mut a = AttrSet::new();
        a.add_uint64("slice.first-sector", 16065).unwrap();
        a.add_text("slice.name", "c0t0d0s0").unwrap();

        let mut seen = a.iter().collect::<Vec<_>>();
        seen.sort_by_key(|(n, _)| *n);
        assert_eq!(
            seen,
            vec![
                ("slice.first-sector", AttrKind::Uint64),
                ("slice.name", AttrKind::Text),
            ]
        );
    }

    #[test]
    fn json_round_trip() {
        let mut a = AttrSet::new();
        a.add_text("target-type", "zfs-rpool").unwrap();
        a.add_text("zfs.rpool.name", "rpool").unwrap();
        a.add_boolean("zfs.rpool.preserve", false).unwrap();

        let j = serde_json::to_string(&a).unwrap();
        let b: AttrSet = serde_json::from_str(&j).unwrap();
        assert_eq!(a, b);
    }
}
