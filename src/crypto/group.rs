//! secp256k1 group elements and scalars with the encodings used on the wire.
//!
//! Points travel as 33-byte compressed SEC1 hex; the identity has no SEC1
//! compressed form and is encoded as 33 zero bytes. Scalars travel as
//! 32-byte big-endian hex and must be canonical (below the group order).

use k256::elliptic_curve::group::Group;
use k256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use k256::elliptic_curve::PrimeField;
use k256::{AffinePoint, EncodedPoint, FieldBytes, ProjectivePoint};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::iter::Sum;
use std::ops::{Add, AddAssign, Mul, Neg, Sub};
use thiserror::Error;

pub use k256::Scalar;

pub const POINT_SIZE: usize = 33;
pub const SCALAR_SIZE: usize = 32;

#[derive(Debug, Error)]
pub enum EncodingError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("expected {expected} bytes, got {got}")]
    Length { expected: usize, got: usize },
    #[error("not a point on the curve")]
    InvalidPoint,
    #[error("scalar is not reduced modulo the group order")]
    InvalidScalar,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GroupElement(ProjectivePoint);

impl GroupElement {
    pub const IDENTITY: GroupElement = GroupElement(ProjectivePoint::IDENTITY);

    /// The standard secp256k1 base point.
    pub fn generator() -> Self {
        Self(ProjectivePoint::GENERATOR)
    }

    pub fn is_identity(&self) -> bool {
        bool::from(self.0.is_identity())
    }

    pub fn to_bytes(&self) -> [u8; POINT_SIZE] {
        let mut out = [0u8; POINT_SIZE];
        if self.is_identity() {
            return out;
        }
        let encoded = self.0.to_affine().to_encoded_point(true);
        out.copy_from_slice(encoded.as_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EncodingError> {
        if bytes.len() != POINT_SIZE {
            return Err(EncodingError::Length {
                expected: POINT_SIZE,
                got: bytes.len(),
            });
        }
        if bytes.iter().all(|b| *b == 0) {
            return Ok(Self::IDENTITY);
        }
        let encoded = EncodedPoint::from_bytes(bytes).map_err(|_| EncodingError::InvalidPoint)?;
        let affine = Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&encoded))
            .ok_or(EncodingError::InvalidPoint)?;
        Ok(Self(ProjectivePoint::from(affine)))
    }

    /// Nothing-up-my-sleeve point: try-and-increment over BLAKE3(label ‖ counter)
    /// interpreted as an x coordinate with even y.
    pub fn hash_to_curve(label: &[u8]) -> Self {
        let mut counter: u32 = 0;
        loop {
            let mut hasher = blake3::Hasher::new();
            hasher.update(b"wabisabi/hash-to-curve");
            hasher.update(&(label.len() as u64).to_le_bytes());
            hasher.update(label);
            hasher.update(&counter.to_le_bytes());
            let digest = hasher.finalize();

            let mut candidate = [0u8; POINT_SIZE];
            candidate[0] = 0x02;
            candidate[1..].copy_from_slice(digest.as_bytes());
            if let Ok(point) = Self::from_bytes(&candidate) {
                if !point.is_identity() {
                    return point;
                }
            }
            counter = counter.wrapping_add(1);
        }
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    pub fn from_hex(s: &str) -> Result<Self, EncodingError> {
        Self::from_bytes(&hex::decode(s)?)
    }
}

impl Default for GroupElement {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Add for GroupElement {
    type Output = GroupElement;
    fn add(self, rhs: GroupElement) -> GroupElement {
        GroupElement(self.0 + rhs.0)
    }
}

impl AddAssign for GroupElement {
    fn add_assign(&mut self, rhs: GroupElement) {
        self.0 += rhs.0;
    }
}

impl Sub for GroupElement {
    type Output = GroupElement;
    fn sub(self, rhs: GroupElement) -> GroupElement {
        GroupElement(self.0 - rhs.0)
    }
}

impl Neg for GroupElement {
    type Output = GroupElement;
    fn neg(self) -> GroupElement {
        GroupElement(-self.0)
    }
}

impl Mul<Scalar> for GroupElement {
    type Output = GroupElement;
    fn mul(self, rhs: Scalar) -> GroupElement {
        GroupElement(self.0 * rhs)
    }
}

impl Mul<&Scalar> for GroupElement {
    type Output = GroupElement;
    fn mul(self, rhs: &Scalar) -> GroupElement {
        GroupElement(self.0 * rhs)
    }
}

impl Sum for GroupElement {
    fn sum<I: Iterator<Item = GroupElement>>(iter: I) -> GroupElement {
        iter.fold(GroupElement::IDENTITY, |acc, p| acc + p)
    }
}

impl Serialize for GroupElement {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for GroupElement {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        GroupElement::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ── Scalars ─────────────────────────────────────────────────────────────

pub fn scalar_to_bytes(s: &Scalar) -> [u8; SCALAR_SIZE] {
    s.to_repr().into()
}

pub fn scalar_from_bytes(bytes: &[u8]) -> Result<Scalar, EncodingError> {
    if bytes.len() != SCALAR_SIZE {
        return Err(EncodingError::Length {
            expected: SCALAR_SIZE,
            got: bytes.len(),
        });
    }
    let repr = FieldBytes::clone_from_slice(bytes);
    Option::<Scalar>::from(Scalar::from_repr(repr)).ok_or(EncodingError::InvalidScalar)
}

pub fn scalar_from_u64(v: u64) -> Scalar {
    Scalar::from(v)
}

/// Signed amounts (credential deltas) map negative values to `-|v|`.
pub fn scalar_from_i64(v: i64) -> Scalar {
    if v >= 0 {
        Scalar::from(v as u64)
    } else {
        -Scalar::from(v.unsigned_abs())
    }
}

pub fn random_scalar<R: RngCore + CryptoRng>(rng: &mut R) -> Scalar {
    use k256::elliptic_curve::Field;
    loop {
        let s = Scalar::random(&mut *rng);
        if !bool::from(s.is_zero()) {
            return s;
        }
    }
}

/// `#[serde(with = "serde_scalar")]` for a single scalar field.
pub mod serde_scalar {
    use super::*;

    pub fn serialize<S: Serializer>(s: &Scalar, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(scalar_to_bytes(s)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Scalar, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        scalar_from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

/// `#[serde(with = "serde_scalars")]` for `Vec<Scalar>` fields.
pub mod serde_scalars {
    use super::*;
    use serde::ser::SerializeSeq;

    pub fn serialize<S: Serializer>(v: &[Scalar], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(v.len()))?;
        for s in v {
            seq.serialize_element(&hex::encode(scalar_to_bytes(s)))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Scalar>, D::Error> {
        let strings = Vec::<String>::deserialize(deserializer)?;
        strings
            .iter()
            .map(|s| {
                let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
                scalar_from_bytes(&bytes).map_err(serde::de::Error::custom)
            })
            .collect()
    }
}
