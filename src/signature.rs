//! Type-signature resolution.
//!
//! A [`TypeTag`] is the closed structural description of a marshallable
//! value; [`Signature`] is its wire signature string plus the metadata the
//! codec needs: validity, the trivial-copy flag for the array fast path,
//! and child signatures for containers.
//!
//! The wire grammar is the interoperability contract and is matched
//! byte-for-byte: single-character codes for the basic types, `a<sig>` for
//! arrays, `{<key><value>}` for dict entries (inside an array only),
//! `(<sig>...)` for structs and `v` for variants.
//!
//! Resolution never panics: a structural type with no representable wire
//! mapping (a dict keyed by a container, an empty struct, nesting past the
//! protocol limits) resolves to an *invalid* signature that registration
//! and call paths reject with a clear diagnostic.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};

use crate::error::{Error, Result};

/// Longest signature string a message may carry.
pub const MAX_SIGNATURE_LEN: usize = 255;
/// Maximum nesting depth for arrays, and separately for structs.
pub const MAX_CONTAINER_DEPTH: usize = 32;

/// Structural description of a marshallable type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Bool,
    Byte,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Double,
    Str,
    ObjectPath,
    Signature,
    UnixFd,
    /// Dynamically typed value; the payload signature travels with the value.
    Variant,
    Array(Box<TypeTag>),
    Dict(Box<TypeTag>, Box<TypeTag>),
    Struct(Vec<TypeTag>),
}

/// The basic (non-container) wire types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Basic {
    Bool,
    Byte,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Double,
    Str,
    ObjectPath,
    Signature,
    UnixFd,
}

impl Basic {
    /// The single-character wire code.
    pub fn code(self) -> u8 {
        match self {
            Basic::Bool => b'b',
            Basic::Byte => b'y',
            Basic::Int16 => b'n',
            Basic::UInt16 => b'q',
            Basic::Int32 => b'i',
            Basic::UInt32 => b'u',
            Basic::Int64 => b'x',
            Basic::UInt64 => b't',
            Basic::Double => b'd',
            Basic::Str => b's',
            Basic::ObjectPath => b'o',
            Basic::Signature => b'g',
            Basic::UnixFd => b'h',
        }
    }

    pub fn from_code(code: u8) -> Option<Basic> {
        Some(match code {
            b'b' => Basic::Bool,
            b'y' => Basic::Byte,
            b'n' => Basic::Int16,
            b'q' => Basic::UInt16,
            b'i' => Basic::Int32,
            b'u' => Basic::UInt32,
            b'x' => Basic::Int64,
            b't' => Basic::UInt64,
            b'd' => Basic::Double,
            b's' => Basic::Str,
            b'o' => Basic::ObjectPath,
            b'g' => Basic::Signature,
            b'h' => Basic::UnixFd,
            _ => return None,
        })
    }

    /// Size in bytes of the fixed-width encoding, if there is one.
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            Basic::Byte => Some(1),
            Basic::Bool => Some(1),
            Basic::Int16 | Basic::UInt16 => Some(2),
            Basic::Int32 | Basic::UInt32 | Basic::UnixFd => Some(4),
            Basic::Int64 | Basic::UInt64 | Basic::Double => Some(8),
            Basic::Str | Basic::ObjectPath | Basic::Signature => None,
        }
    }
}

#[derive(Debug)]
enum Node {
    Basic(Basic),
    Variant,
    Array(Signature),
    Dict(Signature, Signature),
    Struct(Vec<Signature>),
    Invalid(String),
}

/// A resolved wire signature: the signature string plus structure metadata.
///
/// Cheap to clone; the backing string and node tree are shared. Resolving
/// the same Rust type twice through the codec returns the *same* shared
/// signature (see [`cached`]).
#[derive(Clone)]
pub struct Signature {
    text: Arc<str>,
    node: Arc<Node>,
}

impl Signature {
    fn new(text: String, node: Node) -> Signature {
        Signature {
            text: text.into(),
            node: Arc::new(node),
        }
    }

    fn invalid(reason: String) -> Signature {
        Signature::new(String::new(), Node::Invalid(reason))
    }

    pub fn basic(kind: Basic) -> Signature {
        let code = kind.code() as char;
        Signature::new(code.to_string(), Node::Basic(kind))
    }

    pub fn variant() -> Signature {
        Signature::new("v".to_string(), Node::Variant)
    }

    /// Resolve a structural type to its signature.
    ///
    /// Container element types are resolved recursively. An unrepresentable
    /// type yields an invalid signature rather than an error, so callers
    /// can surface one diagnostic at registration time.
    pub fn resolve(tag: &TypeTag) -> Signature {
        match build(tag, 0, 0) {
            Ok(sig) => {
                if sig.text.len() > MAX_SIGNATURE_LEN {
                    Signature::invalid(format!(
                        "signature exceeds {} bytes",
                        MAX_SIGNATURE_LEN
                    ))
                } else {
                    sig
                }
            }
            Err(reason) => Signature::invalid(reason),
        }
    }

    /// The wire signature string; empty for an invalid signature.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// False if the structural type had no representable wire mapping.
    pub fn is_valid(&self) -> bool {
        !matches!(*self.node, Node::Invalid(_))
    }

    /// The diagnostic for an invalid signature.
    pub fn invalid_reason(&self) -> Option<&str> {
        match &*self.node {
            Node::Invalid(reason) => Some(reason),
            _ => None,
        }
    }

    /// Fail with [`Error::InvalidSignature`] if this signature is invalid.
    pub fn ensure_valid(&self) -> Result<&Signature> {
        match &*self.node {
            Node::Invalid(reason) => Err(Error::InvalidSignature(reason.clone())),
            _ => Ok(self),
        }
    }

    pub fn as_basic(&self) -> Option<Basic> {
        match *self.node {
            Node::Basic(kind) => Some(kind),
            _ => None,
        }
    }

    pub fn is_variant(&self) -> bool {
        matches!(*self.node, Node::Variant)
    }

    /// True for a fixed-size basic type other than boolean: such array
    /// elements are eligible for bulk transfer in one transport call.
    pub fn is_trivial(&self) -> bool {
        match *self.node {
            Node::Basic(Basic::Bool) => false,
            Node::Basic(kind) => kind.fixed_size().is_some(),
            _ => false,
        }
    }

    /// Fixed element size for trivial signatures.
    pub fn fixed_size(&self) -> Option<usize> {
        match *self.node {
            Node::Basic(kind) => kind.fixed_size(),
            _ => None,
        }
    }

    /// Element signature of an array (a dict resolves as an array of
    /// entries and reports its entry here via key/value instead).
    pub fn element(&self) -> Option<&Signature> {
        match &*self.node {
            Node::Array(el) => Some(el),
            _ => None,
        }
    }

    pub fn dict_entry(&self) -> Option<(&Signature, &Signature)> {
        match &*self.node {
            Node::Dict(k, v) => Some((k, v)),
            _ => None,
        }
    }

    pub fn fields(&self) -> Option<&[Signature]> {
        match &*self.node {
            Node::Struct(fields) => Some(fields),
            _ => None,
        }
    }

    /// Array signature with the given element signature.
    pub fn array_of(elem: Signature) -> Signature {
        if !elem.is_valid() {
            return elem;
        }
        let text = format!("a{}", elem.as_str());
        if text.len() > MAX_SIGNATURE_LEN {
            return Signature::invalid(format!("signature exceeds {} bytes", MAX_SIGNATURE_LEN));
        }
        Signature::new(text, Node::Array(elem))
    }

    /// Dict-entry array signature; the key must be a basic type.
    pub fn dict_of(key: Signature, value: Signature) -> Signature {
        if !key.is_valid() {
            return key;
        }
        if !value.is_valid() {
            return value;
        }
        if key.as_basic().is_none() {
            return Signature::invalid(format!(
                "dict key must be a basic type, got '{}'",
                key.as_str()
            ));
        }
        let text = format!("a{{{}{}}}", key.as_str(), value.as_str());
        if text.len() > MAX_SIGNATURE_LEN {
            return Signature::invalid(format!("signature exceeds {} bytes", MAX_SIGNATURE_LEN));
        }
        Signature::new(text, Node::Dict(key, value))
    }

    /// Struct signature over the given non-empty field list.
    pub fn struct_of(fields: Vec<Signature>) -> Signature {
        if fields.is_empty() {
            return Signature::invalid("struct must have at least one field".to_string());
        }
        let mut text = String::from("(");
        for field in &fields {
            if !field.is_valid() {
                return field.clone();
            }
            text.push_str(field.as_str());
        }
        text.push(')');
        if text.len() > MAX_SIGNATURE_LEN {
            return Signature::invalid(format!("signature exceeds {} bytes", MAX_SIGNATURE_LEN));
        }
        Signature::new(text, Node::Struct(fields))
    }

    /// Parse one complete type from a wire signature string.
    pub fn parse(text: &str) -> Result<Signature> {
        let mut sigs = Signature::parse_many(text)?;
        if sigs.len() == 1 {
            Ok(sigs.remove(0))
        } else {
            Err(Error::InvalidSignature(format!(
                "expected a single complete type, got '{}'",
                text
            )))
        }
    }

    /// Parse a sequence of complete types, e.g. a message body signature.
    pub fn parse_many(text: &str) -> Result<Vec<Signature>> {
        if text.len() > MAX_SIGNATURE_LEN {
            return Err(Error::InvalidSignature(format!(
                "signature exceeds {} bytes",
                MAX_SIGNATURE_LEN
            )));
        }
        let bytes = text.as_bytes();
        let mut pos = 0;
        let mut out = Vec::new();
        while pos < bytes.len() {
            out.push(parse_one(bytes, &mut pos, 0, 0)?);
        }
        Ok(out)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "Signature({})", self.text)
        } else {
            write!(f, "Signature(<invalid: {}>)", self.invalid_reason().unwrap_or(""))
        }
    }
}

impl PartialEq for Signature {
    fn eq(&self, other: &Signature) -> bool {
        self.is_valid() == other.is_valid() && self.text == other.text
    }
}

impl Eq for Signature {}

impl std::hash::Hash for Signature {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.text.hash(state);
    }
}

fn build(
    tag: &TypeTag,
    array_depth: usize,
    struct_depth: usize,
) -> std::result::Result<Signature, String> {
    let basic = |kind: Basic| Ok(Signature::basic(kind));
    match tag {
        TypeTag::Bool => basic(Basic::Bool),
        TypeTag::Byte => basic(Basic::Byte),
        TypeTag::Int16 => basic(Basic::Int16),
        TypeTag::UInt16 => basic(Basic::UInt16),
        TypeTag::Int32 => basic(Basic::Int32),
        TypeTag::UInt32 => basic(Basic::UInt32),
        TypeTag::Int64 => basic(Basic::Int64),
        TypeTag::UInt64 => basic(Basic::UInt64),
        TypeTag::Double => basic(Basic::Double),
        TypeTag::Str => basic(Basic::Str),
        TypeTag::ObjectPath => basic(Basic::ObjectPath),
        TypeTag::Signature => basic(Basic::Signature),
        TypeTag::UnixFd => basic(Basic::UnixFd),
        TypeTag::Variant => Ok(Signature::variant()),
        TypeTag::Array(elem) => {
            if array_depth + 1 > MAX_CONTAINER_DEPTH {
                return Err("array nesting too deep".to_string());
            }
            let elem = build(elem, array_depth + 1, struct_depth)?;
            let text = format!("a{}", elem.as_str());
            Ok(Signature::new(text, Node::Array(elem)))
        }
        TypeTag::Dict(key, value) => {
            if array_depth + 1 > MAX_CONTAINER_DEPTH {
                return Err("array nesting too deep".to_string());
            }
            let key = build(key, array_depth + 1, struct_depth)?;
            if key.as_basic().is_none() {
                return Err(format!(
                    "dict key must be a basic type, got '{}'",
                    key.as_str()
                ));
            }
            let value = build(value, array_depth + 1, struct_depth)?;
            let text = format!("a{{{}{}}}", key.as_str(), value.as_str());
            Ok(Signature::new(text, Node::Dict(key, value)))
        }
        TypeTag::Struct(fields) => {
            if fields.is_empty() {
                return Err("struct must have at least one field".to_string());
            }
            if struct_depth + 1 > MAX_CONTAINER_DEPTH {
                return Err("struct nesting too deep".to_string());
            }
            let mut text = String::from("(");
            let mut children = Vec::with_capacity(fields.len());
            for field in fields {
                let child = build(field, array_depth, struct_depth + 1)?;
                text.push_str(child.as_str());
                children.push(child);
            }
            text.push(')');
            Ok(Signature::new(text, Node::Struct(children)))
        }
    }
}

fn parse_one(
    bytes: &[u8],
    pos: &mut usize,
    array_depth: usize,
    struct_depth: usize,
) -> Result<Signature> {
    let whole = || String::from_utf8_lossy(bytes).into_owned();
    let Some(&code) = bytes.get(*pos) else {
        return Err(Error::InvalidSignature(format!(
            "truncated signature '{}'",
            whole()
        )));
    };
    *pos += 1;
    if let Some(kind) = Basic::from_code(code) {
        return Ok(Signature::basic(kind));
    }
    match code {
        b'v' => Ok(Signature::variant()),
        b'a' => {
            if array_depth + 1 > MAX_CONTAINER_DEPTH {
                return Err(Error::InvalidSignature("array nesting too deep".into()));
            }
            if bytes.get(*pos) == Some(&b'{') {
                *pos += 1;
                let key = parse_one(bytes, pos, array_depth + 1, struct_depth)?;
                if key.as_basic().is_none() {
                    return Err(Error::InvalidSignature(format!(
                        "dict key must be a basic type in '{}'",
                        whole()
                    )));
                }
                let value = parse_one(bytes, pos, array_depth + 1, struct_depth)?;
                if bytes.get(*pos) != Some(&b'}') {
                    return Err(Error::InvalidSignature(format!(
                        "unterminated dict entry in '{}'",
                        whole()
                    )));
                }
                *pos += 1;
                let text = format!("a{{{}{}}}", key.as_str(), value.as_str());
                Ok(Signature::new(text, Node::Dict(key, value)))
            } else {
                let elem = parse_one(bytes, pos, array_depth + 1, struct_depth)?;
                let text = format!("a{}", elem.as_str());
                Ok(Signature::new(text, Node::Array(elem)))
            }
        }
        b'(' => {
            if struct_depth + 1 > MAX_CONTAINER_DEPTH {
                return Err(Error::InvalidSignature("struct nesting too deep".into()));
            }
            let mut fields = Vec::new();
            let mut text = String::from("(");
            loop {
                match bytes.get(*pos) {
                    Some(&b')') => {
                        *pos += 1;
                        break;
                    }
                    Some(_) => {
                        let field = parse_one(bytes, pos, array_depth, struct_depth + 1)?;
                        text.push_str(field.as_str());
                        fields.push(field);
                    }
                    None => {
                        return Err(Error::InvalidSignature(format!(
                            "unterminated struct in '{}'",
                            whole()
                        )))
                    }
                }
            }
            if fields.is_empty() {
                return Err(Error::InvalidSignature(format!(
                    "empty struct in '{}'",
                    whole()
                )));
            }
            text.push(')');
            Ok(Signature::new(text, Node::Struct(fields)))
        }
        other => Err(Error::InvalidSignature(format!(
            "unknown type code '{}' in '{}'",
            other as char,
            whole()
        ))),
    }
}

static TYPE_CACHE: OnceLock<RwLock<HashMap<TypeId, Signature>>> = OnceLock::new();

/// Per-Rust-type signature cache: the signature for a given structural type
/// is computed at most once per process and shared afterwards.
pub(crate) fn cached<T: 'static>(tag: fn() -> TypeTag) -> Signature {
    let cache = TYPE_CACHE.get_or_init(|| RwLock::new(HashMap::new()));
    let id = TypeId::of::<T>();
    if let Some(sig) = cache.read().expect("signature cache poisoned").get(&id) {
        return sig.clone();
    }
    let sig = Signature::resolve(&tag());
    cache
        .write()
        .expect("signature cache poisoned")
        .entry(id)
        .or_insert(sig)
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_codes() {
        assert_eq!(Signature::resolve(&TypeTag::Bool).as_str(), "b");
        assert_eq!(Signature::resolve(&TypeTag::Byte).as_str(), "y");
        assert_eq!(Signature::resolve(&TypeTag::Int16).as_str(), "n");
        assert_eq!(Signature::resolve(&TypeTag::UInt16).as_str(), "q");
        assert_eq!(Signature::resolve(&TypeTag::Int32).as_str(), "i");
        assert_eq!(Signature::resolve(&TypeTag::UInt32).as_str(), "u");
        assert_eq!(Signature::resolve(&TypeTag::Int64).as_str(), "x");
        assert_eq!(Signature::resolve(&TypeTag::UInt64).as_str(), "t");
        assert_eq!(Signature::resolve(&TypeTag::Double).as_str(), "d");
        assert_eq!(Signature::resolve(&TypeTag::Str).as_str(), "s");
        assert_eq!(Signature::resolve(&TypeTag::ObjectPath).as_str(), "o");
        assert_eq!(Signature::resolve(&TypeTag::Signature).as_str(), "g");
        assert_eq!(Signature::resolve(&TypeTag::UnixFd).as_str(), "h");
        assert_eq!(Signature::resolve(&TypeTag::Variant).as_str(), "v");
    }

    #[test]
    fn container_signatures() {
        let list = TypeTag::Array(Box::new(TypeTag::Int32));
        assert_eq!(Signature::resolve(&list).as_str(), "ai");

        let map = TypeTag::Dict(Box::new(TypeTag::Str), Box::new(TypeTag::Variant));
        assert_eq!(Signature::resolve(&map).as_str(), "a{sv}");

        let record = TypeTag::Struct(vec![
            TypeTag::Str,
            TypeTag::UInt32,
            TypeTag::Array(Box::new(TypeTag::Byte)),
        ]);
        assert_eq!(Signature::resolve(&record).as_str(), "(suay)");
    }

    #[test]
    fn resolution_is_deterministic() {
        let tag = TypeTag::Dict(
            Box::new(TypeTag::Str),
            Box::new(TypeTag::Array(Box::new(TypeTag::Struct(vec![
                TypeTag::Int64,
                TypeTag::Variant,
            ])))),
        );
        let a = Signature::resolve(&tag);
        let b = Signature::resolve(&tag);
        assert_eq!(a, b);
        assert_eq!(a.as_str(), b.as_str());
        assert_eq!(a.as_str(), "a{sa(xv)}");
    }

    #[test]
    fn invalid_dict_key() {
        let tag = TypeTag::Dict(
            Box::new(TypeTag::Array(Box::new(TypeTag::Byte))),
            Box::new(TypeTag::Int32),
        );
        let sig = Signature::resolve(&tag);
        assert!(!sig.is_valid());
        assert!(sig.ensure_valid().is_err());
        assert!(sig.invalid_reason().unwrap().contains("dict key"));
    }

    #[test]
    fn invalid_empty_struct() {
        let sig = Signature::resolve(&TypeTag::Struct(vec![]));
        assert!(!sig.is_valid());
    }

    #[test]
    fn invalid_deep_nesting() {
        let mut tag = TypeTag::Byte;
        for _ in 0..(MAX_CONTAINER_DEPTH + 1) {
            tag = TypeTag::Array(Box::new(tag));
        }
        assert!(!Signature::resolve(&tag).is_valid());
    }

    #[test]
    fn trivial_flags() {
        assert!(Signature::resolve(&TypeTag::UInt64).is_trivial());
        assert!(Signature::resolve(&TypeTag::Double).is_trivial());
        assert!(!Signature::resolve(&TypeTag::Bool).is_trivial());
        assert!(!Signature::resolve(&TypeTag::Str).is_trivial());
        assert!(!Signature::resolve(&TypeTag::Array(Box::new(TypeTag::Byte))).is_trivial());
    }

    #[test]
    fn parse_round_trips() {
        for text in ["b", "ai", "a{sv}", "(suay)", "a{sa(xv)}", "v", "aa{is}"] {
            let sig = Signature::parse(text).unwrap();
            assert_eq!(sig.as_str(), text);
        }
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(Signature::parse("z").is_err());
        assert!(Signature::parse("a").is_err());
        assert!(Signature::parse("(").is_err());
        assert!(Signature::parse("()").is_err());
        assert!(Signature::parse("a{vs}").is_err());
        assert!(Signature::parse("a{si").is_err());
        assert!(Signature::parse("ii").is_err());
        assert!(Signature::parse("{si}").is_err());
    }

    #[test]
    fn parse_many_splits_body_signatures() {
        let sigs = Signature::parse_many("ia{sv}s").unwrap();
        let texts: Vec<_> = sigs.iter().map(|s| s.as_str().to_string()).collect();
        assert_eq!(texts, vec!["i", "a{sv}", "s"]);
    }

    #[test]
    fn typed_cache_is_shared() {
        struct Marker;
        let a = cached::<Marker>(|| TypeTag::Array(Box::new(TypeTag::Int32)));
        let b = cached::<Marker>(|| TypeTag::Array(Box::new(TypeTag::Int32)));
        assert_eq!(a, b);
        assert!(std::sync::Arc::ptr_eq(&a.text, &b.text));
    }
}
