//! Cache key derivation.
//!
//! Keys are canonical strings: the same logical inputs always produce the
//! same key, and a mutated entity produces a new key (the freshness token is
//! part of the key), so invalidation happens by abandonment rather than by
//! deletion. Unordered key material is canonicalized by an explicit
//! sort-then-serialize step; nothing here relies on map iteration order.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::entity::Cacheable;

/// Longest key accepted verbatim. The memcached text protocol caps keys at
/// 250 bytes, and every backend must accept every derived key, so the cap is
/// enforced centrally: longer keys are truncated and suffixed with a digest
/// of the full text.
pub const MAX_KEY_BYTES: usize = 250;

const DIGEST_KEEP_BYTES: usize = 200;
const DIGEST_HEX_CHARS: usize = 32;

/// A canonical cache key.
///
/// Construction normalizes overlong keys; two `CacheKey`s are interchangeable
/// with their string form for every store operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        if raw.len() <= MAX_KEY_BYTES {
            return Self(raw);
        }

        let digest = Sha256::digest(raw.as_bytes());
        let mut cut = DIGEST_KEEP_BYTES;
        while !raw.is_char_boundary(cut) {
            cut -= 1;
        }
        let mut normalized = String::with_capacity(cut + 3 + DIGEST_HEX_CHARS);
        normalized.push_str(&raw[..cut]);
        normalized.push_str(":d:");
        normalized.push_str(&hex::encode(digest)[..DIGEST_HEX_CHARS]);
        Self(normalized)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for CacheKey {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

/// Structured key material.
///
/// Scalars are compared by their canonical text, so `Int(42)` and `Str("42")`
/// are deliberately the same key material. Sequences preserve order; maps are
/// unordered and canonicalized by sorting entries on `(key, rendered value)`
/// before serialization, so two maps built in different orders derive the
/// same key.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyMaterial {
    None,
    Str(String),
    Int(i64),
    Bool(bool),
    Seq(Vec<KeyMaterial>),
    Map(Vec<(String, KeyMaterial)>),
}

impl KeyMaterial {
    pub fn str(value: impl Into<String>) -> Self {
        Self::Str(value.into())
    }

    pub fn seq(items: impl IntoIterator<Item = KeyMaterial>) -> Self {
        Self::Seq(items.into_iter().collect())
    }

    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, KeyMaterial)>,
    {
        Self::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Render the canonical text for this material.
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        self.render(&mut out);
        out
    }

    fn render(&self, out: &mut String) {
        match self {
            Self::None => out.push('~'),
            Self::Str(s) => escape_into(s, out),
            Self::Int(i) => out.push_str(&i.to_string()),
            Self::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            Self::Seq(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    item.render(out);
                }
                out.push(']');
            }
            Self::Map(entries) => {
                let mut rendered: Vec<(String, String)> = entries
                    .iter()
                    .map(|(k, v)| {
                        let mut key = String::new();
                        escape_into(k, &mut key);
                        (key, v.canonical())
                    })
                    .collect();
                rendered.sort();
                out.push('{');
                for (i, (key, value)) in rendered.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(key);
                    out.push('=');
                    out.push_str(value);
                }
                out.push('}');
            }
        }
    }
}

/// Escape the structural characters so canonical rendering stays injective:
/// `Str("[a]")` and `Seq([Str("a")])` must never collide.
fn escape_into(s: &str, out: &mut String) {
    for ch in s.chars() {
        if matches!(ch, '\\' | '[' | ']' | '{' | '}' | ',' | '=' | '~') {
            out.push('\\');
        }
        out.push(ch);
    }
}

/// Derive a key whose freshness token is embedded in the key itself.
///
/// Pattern: `namespace/type/id-token[/extra]`. Any mutation that bumps the
/// entity's freshness signal yields a disjoint key; the old entry is never
/// read again and falls to eviction or TTL.
pub fn derive<E: Cacheable + ?Sized>(
    namespace: &str,
    entity: &E,
    extra: Option<&KeyMaterial>,
) -> CacheKey {
    let mut raw = entity_segment(namespace, entity);
    raw.push('-');
    raw.push_str(&entity.freshness().token());
    push_extra(&mut raw, extra);
    CacheKey::new(raw)
}

/// Derive a stable (recyclable) key: the freshness token is left out of the
/// key and should instead be written as the entry's version tag, to be
/// checked at read time. One key per entity, so backends that charge per key
/// stay compact.
pub fn derive_stable<E: Cacheable + ?Sized>(
    namespace: &str,
    entity: &E,
    extra: Option<&KeyMaterial>,
) -> CacheKey {
    let mut raw = entity_segment(namespace, entity);
    push_extra(&mut raw, extra);
    CacheKey::new(raw)
}

/// Derive a key from composite material alone (no entity involved).
pub fn derive_raw(namespace: &str, material: &KeyMaterial) -> CacheKey {
    let mut raw = String::new();
    if !namespace.is_empty() {
        raw.push_str(namespace);
        raw.push('/');
    }
    raw.push_str(&material.canonical());
    CacheKey::new(raw)
}

fn entity_segment<E: Cacheable + ?Sized>(namespace: &str, entity: &E) -> String {
    let mut raw = String::new();
    if !namespace.is_empty() {
        raw.push_str(namespace);
        raw.push('/');
    }
    raw.push_str(entity.cache_prefix());
    raw.push('/');
    raw.push_str(&entity.cache_id());
    raw
}

fn push_extra(raw: &mut String, extra: Option<&KeyMaterial>) {
    if let Some(material) = extra {
        raw.push('/');
        raw.push_str(&material.canonical());
    }
}
