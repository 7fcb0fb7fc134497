//! Type identity for per-type cache namespaces.
//!
//! A [`TypeTag`] names the value type a cache instance stores. It doubles as
//! the logical channel for completion filtering and, suffixed with `:`, as
//! the key prefix in both the local cache and the remote store.
//!
//! Tags derived from Rust types follow `<module path>:<type name>`
//! (`app::model:User`); primitives and `String` use their bare name
//! (`u64`, `String`). Explicit tags (`TypeTag::named("com.acme.User")`)
//! are accepted verbatim.

use std::fmt;

/// Primitive type names that are used without a module path.
const PRIMITIVES: &[&str] = &[
    "bool", "char", "str", "i8", "i16", "i32", "i64", "i128", "isize", "u8", "u16", "u32",
    "u64", "u128", "usize", "f32", "f64",
];

/// Stable identity of a cached value type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeTag(String);

impl TypeTag {
    /// Derives the tag of `T` from its Rust type name.
    #[must_use]
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self::from_type_name(std::any::type_name::<T>())
    }

    /// Uses `tag` verbatim as the type identity.
    #[must_use]
    pub fn named(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// Converts a fully qualified Rust type name into a tag.
    ///
    /// The split between path and name happens at the last `::` before any
    /// generic arguments, so `alloc::vec::Vec<app::User>` becomes
    /// `alloc::vec:Vec<app::User>`.
    #[must_use]
    pub fn from_type_name(full: &str) -> Self {
        if full == "alloc::string::String" {
            return Self("String".to_string());
        }
        if PRIMITIVES.contains(&full) {
            return Self(full.to_string());
        }

        let generics_at = full.find('<').unwrap_or(full.len());
        let (base, generics) = full.split_at(generics_at);
        match base.rsplit_once("::") {
            Some((path, name)) => Self(format!("{path}:{name}{generics}")),
            None => Self(full.to_string()),
        }
    }

    /// The tag as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key prefix for this type: the tag followed by `:`.
    #[must_use]
    pub fn prefix(&self) -> String {
        format!("{}:", self.0)
    }

    /// Applies this type's prefix to an unprefixed key.
    #[must_use]
    pub fn prefixed_key(&self, key: &str) -> String {
        let mut full = String::with_capacity(self.0.len() + 1 + key.len());
        full.push_str(&self.0);
        full.push(':');
        full.push_str(key);
        full
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TypeTag {
    fn from(tag: &str) -> Self {
        Self::named(tag)
    }
}
