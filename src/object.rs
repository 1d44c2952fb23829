//! Object contract for indexed values plus the stock feature-vector object.
//! Encoding v1: oid (4 LE) + name length (4 LE) + UTF-8 name + dimension
//! (4 LE) + features (8 bytes LE each).

use crate::error::{Error, Result};

/// A value the tree can store: byte-serializable to a size known in
/// advance. Implementations must round-trip exactly through
/// `to_bytes`/`from_bytes`.
pub trait Object: Clone + PartialEq {
    /// Serialized footprint in bytes.
    fn serialized_size(&self) -> usize;

    /// Serialize to owned bytes. `bytes.len()` must equal
    /// `serialized_size()`.
    fn to_bytes(&self) -> Vec<u8>;

    /// Rebuild from bytes previously produced by `to_bytes`.
    fn from_bytes(bytes: &[u8]) -> Result<Self>
    where
        Self: Sized;

    /// Optional external identifier.
    fn oid(&self) -> Option<u32> {
        None
    }
}

/// Objects exposing a flat `f64` feature array; the stock metrics operate
/// on this view.
pub trait FeatureVector {
    fn features(&self) -> &[f64];
}

/// A named feature vector: the unit of ingestion for the CSV harness.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorObject {
    oid: u32,
    name: String,
    features: Vec<f64>,
}

impl VectorObject {
    pub fn new(oid: u32, name: impl Into<String>, features: Vec<f64>) -> Self {
        Self {
            oid,
            name: name.into(),
            features,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dimension(&self) -> usize {
        self.features.len()
    }
}

impl FeatureVector for VectorObject {
    fn features(&self) -> &[f64] {
        &self.features
    }
}

impl Object for VectorObject {
    fn serialized_size(&self) -> usize {
        4 + 4 + self.name.len() + 4 + 8 * self.features.len()
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.serialized_size());
        buf.extend_from_slice(&self.oid.to_le_bytes());
        buf.extend_from_slice(&(self.name.len() as u32).to_le_bytes());
        buf.extend_from_slice(self.name.as_bytes());
        buf.extend_from_slice(&(self.features.len() as u32).to_le_bytes());
        for f in &self.features {
            buf.extend_from_slice(&f.to_le_bytes());
        }
        buf
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let need = |n: usize, at: usize| -> Result<()> {
            if at + n > bytes.len() {
                Err(Error::Format("truncated vector object".into()))
            } else {
                Ok(())
            }
        };
        need(8, 0)?;
        let oid = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let name_len = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;
        need(name_len + 4, 8)?;
        let name = std::str::from_utf8(&bytes[8..8 + name_len])
            .map_err(|e| Error::Format(format!("invalid utf8 in object name: {}", e)))?
            .to_string();
        let mut at = 8 + name_len;
        let dim = u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap()) as usize;
        at += 4;
        need(8 * dim, at)?;
        let mut features = Vec::with_capacity(dim);
        for _ in 0..dim {
            features.push(f64::from_le_bytes(bytes[at..at + 8].try_into().unwrap()));
            at += 8;
        }
        Ok(Self { oid, name, features })
    }

    fn oid(&self) -> Option<u32> {
        Some(self.oid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let o = VectorObject::new(42, "city", vec![1.5, -2.0, 0.25]);
        let bytes = o.to_bytes();
        assert_eq!(bytes.len(), o.serialized_size());
        let back = VectorObject::from_bytes(&bytes).unwrap();
        assert_eq!(back, o);
        assert_eq!(back.oid(), Some(42));
    }

    #[test]
    fn empty_name_and_features() {
        let o = VectorObject::new(0, "", vec![]);
        let back = VectorObject::from_bytes(&o.to_bytes()).unwrap();
        assert_eq!(back, o);
        assert_eq!(back.dimension(), 0);
    }

    #[test]
    fn truncated_bytes_rejected() {
        let o = VectorObject::new(1, "x", vec![3.0]);
        let bytes = o.to_bytes();
        assert!(matches!(
            VectorObject::from_bytes(&bytes[..bytes.len() - 1]),
            Err(Error::Format(_))
        ));
    }
}
