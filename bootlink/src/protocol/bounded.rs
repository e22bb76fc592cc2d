//! Fixed-capacity field storage.
//!
//! Every string and bytes field in the message catalog has a schema maximum.
//! These wrappers hold the value in a `heapless` container of exactly that
//! capacity, so an over-long value is rejected when it is constructed rather
//! than truncated later.

use heapless::{String as HString, Vec as HVec};
use std::fmt;
use std::ops::Deref;
use thiserror::Error;

/// A value did not fit the fixed capacity of its field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("value of {length} bytes exceeds capacity {capacity}")]
pub struct CapacityError {
    /// Length of the rejected value.
    pub length: usize,
    /// Field capacity.
    pub capacity: usize,
}

/// UTF-8 string with a maximum length of `N` bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BoundedString<const N: usize>(HString<N>);

impl<const N: usize> BoundedString<N> {
    /// Field capacity in bytes.
    pub const CAPACITY: usize = N;

    /// Create an empty string.
    pub fn new() -> Self {
        Self(HString::new())
    }

    /// Borrow the contents.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the string is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<const N: usize> TryFrom<&str> for BoundedString<N> {
    type Error = CapacityError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let mut inner = HString::new();
        inner.push_str(value).map_err(|()| CapacityError {
            length: value.len(),
            capacity: N,
        })?;
        Ok(Self(inner))
    }
}

impl<const N: usize> Deref for BoundedString<N> {
    type Target = str;

    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl<const N: usize> fmt::Display for BoundedString<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Byte string with a maximum length of `N` bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BoundedBytes<const N: usize>(HVec<u8, N>);

impl<const N: usize> BoundedBytes<N> {
    /// Field capacity in bytes.
    pub const CAPACITY: usize = N;

    /// Create an empty value.
    pub fn new() -> Self {
        Self(HVec::new())
    }

    /// Borrow the contents.
    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the value is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lowercase hex rendering, for logs and JSON output.
    pub fn to_hex(&self) -> String {
        hex::encode(self.as_slice())
    }
}

impl<const N: usize> TryFrom<&[u8]> for BoundedBytes<N> {
    type Error = CapacityError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        HVec::from_slice(value)
            .map(Self)
            .map_err(|()| CapacityError {
                length: value.len(),
                capacity: N,
            })
    }
}

impl<const N: usize> From<[u8; N]> for BoundedBytes<N> {
    fn from(value: [u8; N]) -> Self {
        let mut inner = HVec::new();
        // N elements always fit a capacity of N.
        let _ = inner.extend_from_slice(&value);
        Self(inner)
    }
}

impl<const N: usize> Deref for BoundedBytes<N> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

#[cfg(feature = "serde")]
mod serde_impl {
    use super::{BoundedBytes, BoundedString};
    use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error as _};

    impl<const N: usize> Serialize for BoundedString<N> {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.serialize_str(self.as_str())
        }
    }

    impl<'de, const N: usize> Deserialize<'de> for BoundedString<N> {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            let value = String::deserialize(deserializer)?;
            Self::try_from(value.as_str()).map_err(D::Error::custom)
        }
    }

    // Bytes fields are written as hex strings so they read naturally in TOML.
    impl<const N: usize> Serialize for BoundedBytes<N> {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.serialize_str(&self.to_hex())
        }
    }

    impl<'de, const N: usize> Deserialize<'de> for BoundedBytes<N> {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            let value = String::deserialize(deserializer)?;
            let raw = hex::decode(value.trim()).map_err(D::Error::custom)?;
            Self::try_from(raw.as_slice()).map_err(D::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_within_capacity() {
        let s = BoundedString::<8>::try_from("bootldr").unwrap();
        assert_eq!(s.as_str(), "bootldr");
        assert_eq!(s.len(), 7);
    }

    #[test]
    fn test_string_exact_capacity() {
        let s = BoundedString::<4>::try_from("abcd").unwrap();
        assert_eq!(&*s, "abcd");
    }

    #[test]
    fn test_string_over_capacity_rejected() {
        let err = BoundedString::<4>::try_from("abcde").unwrap_err();
        assert_eq!(
            err,
            CapacityError {
                length: 5,
                capacity: 4
            }
        );
    }

    #[test]
    fn test_bytes_over_capacity_rejected() {
        assert!(BoundedBytes::<2>::try_from(&[1u8, 2, 3][..]).is_err());
        assert_eq!(
            BoundedBytes::<3>::try_from(&[1u8, 2, 3][..])
                .unwrap()
                .as_slice(),
            &[1, 2, 3]
        );
    }

    #[test]
    fn test_bytes_from_array_and_hex() {
        let b = BoundedBytes::from([0xAB, 0x01]);
        assert_eq!(b.len(), 2);
        assert_eq!(b.to_hex(), "ab01");
    }

    #[test]
    fn test_empty_is_distinct_from_absent() {
        let present: Option<BoundedString<4>> = Some(BoundedString::new());
        let absent: Option<BoundedString<4>> = None;
        assert_ne!(present, absent);
    }
}
