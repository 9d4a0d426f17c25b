//! Validated DBus object paths.
//!
//! [`ObjectPath`] and [`ObjectPathBuf`] relate like `str` and `String`.
//! A valid object path is absolute, uses `/` separators, allows only
//! `[A-Z][a-z][0-9]_` in each element, and never ends in a separator
//! unless it is the root path itself.

use std::borrow::Borrow;
use std::convert::TryFrom;
use std::fmt::{Display, Formatter};
use std::ops::Deref;

use crate::error::DecodeError;

/// Ways a string can fail to be a valid object path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidObjectPath {
    NoRoot,
    ContainsInvalidCharacters,
    ConsecutiveSlashes,
    TrailingSlash,
}

impl From<InvalidObjectPath> for DecodeError {
    fn from(_: InvalidObjectPath) -> Self {
        DecodeError::InvalidPath
    }
}

/// A borrowed slice of a validated DBus object path.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ObjectPath {
    inner: str,
}

impl ObjectPath {
    fn validate(path: &str) -> Result<(), InvalidObjectPath> {
        if !path.starts_with('/') {
            return Err(InvalidObjectPath::NoRoot);
        }
        let mut last_was_sep = false;
        for character in path.chars() {
            match character {
                'A'..='Z' | 'a'..='z' | '0'..='9' | '_' => {
                    last_was_sep = false;
                }
                '/' => {
                    if last_was_sep {
                        return Err(InvalidObjectPath::ConsecutiveSlashes);
                    }
                    last_was_sep = true;
                }
                _ => return Err(InvalidObjectPath::ContainsInvalidCharacters),
            }
        }
        if path.len() != 1 && path.ends_with('/') {
            return Err(InvalidObjectPath::TrailingSlash);
        }
        Ok(())
    }
    /// Validate and borrow a `str` as an `ObjectPath`.
    pub fn new(path: &str) -> Result<&ObjectPath, InvalidObjectPath> {
        Self::validate(path)?;
        Ok(unsafe { Self::new_no_val(path) })
    }
    unsafe fn new_no_val(path: &str) -> &ObjectPath {
        &*(path as *const str as *const ObjectPath)
    }
    pub fn as_str(&self) -> &str {
        &self.inner
    }
    /// The root object path, `/`.
    pub fn root() -> &'static ObjectPath {
        unsafe { Self::new_no_val("/") }
    }
    /// Iterates over the path elements, excluding the root separator.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.inner.split('/').filter(|c| !c.is_empty())
    }
    /// The parent path, or `None` for the root.
    pub fn parent(&self) -> Option<&ObjectPath> {
        if self.inner.len() == 1 {
            return None;
        }
        let end = self.inner.rfind('/').unwrap();
        let parent = if end == 0 { "/" } else { &self.inner[..end] };
        Some(unsafe { Self::new_no_val(parent) })
    }
    /// Whether `self` is `other` or an ancestor of it.
    pub fn is_prefix_of(&self, other: &ObjectPath) -> bool {
        let mut these = self.components();
        let mut those = other.components();
        loop {
            match (these.next(), those.next()) {
                (Some(a), Some(b)) if a == b => continue,
                (Some(_), _) => return false,
                (None, _) => return true,
            }
        }
    }
}

impl Deref for ObjectPath {
    type Target = str;
    fn deref(&self) -> &str {
        &self.inner
    }
}

impl Display for ObjectPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.inner)
    }
}

impl ToOwned for ObjectPath {
    type Owned = ObjectPathBuf;
    fn to_owned(&self) -> ObjectPathBuf {
        ObjectPathBuf {
            inner: self.inner.to_string(),
        }
    }
}

impl<'a> TryFrom<&'a str> for &'a ObjectPath {
    type Error = InvalidObjectPath;
    fn try_from(path: &'a str) -> Result<Self, InvalidObjectPath> {
        ObjectPath::new(path)
    }
}

impl AsRef<ObjectPath> for ObjectPath {
    fn as_ref(&self) -> &ObjectPath {
        self
    }
}

/// An owned, validated DBus object path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectPathBuf {
    inner: String,
}

impl ObjectPathBuf {
    pub fn new(path: &str) -> Result<Self, InvalidObjectPath> {
        Ok(ObjectPath::new(path)?.to_owned())
    }
    pub fn as_path(&self) -> &ObjectPath {
        self
    }
    pub fn into_string(self) -> String {
        self.inner
    }
}

impl Deref for ObjectPathBuf {
    type Target = ObjectPath;
    fn deref(&self) -> &ObjectPath {
        // inner was validated on construction
        unsafe { ObjectPath::new_no_val(&self.inner) }
    }
}

impl Borrow<ObjectPath> for ObjectPathBuf {
    fn borrow(&self) -> &ObjectPath {
        self
    }
}

impl AsRef<ObjectPath> for ObjectPathBuf {
    fn as_ref(&self) -> &ObjectPath {
        self
    }
}

impl Display for ObjectPathBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.inner)
    }
}

impl TryFrom<&str> for ObjectPathBuf {
    type Error = InvalidObjectPath;
    fn try_from(path: &str) -> Result<Self, InvalidObjectPath> {
        ObjectPathBuf::new(path)
    }
}

impl TryFrom<String> for ObjectPathBuf {
    type Error = InvalidObjectPath;
    fn try_from(path: String) -> Result<Self, InvalidObjectPath> {
        ObjectPath::validate(&path)?;
        Ok(ObjectPathBuf { inner: path })
    }
}

impl PartialEq<str> for ObjectPathBuf {
    fn eq(&self, other: &str) -> bool {
        self.inner == other
    }
}
